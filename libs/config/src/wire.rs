//! Wire format of the connection options, as read from JSON or YAML.
//!
//! Everything here is unvalidated; see [`ConnectionConfig`] for the checked form.
//!
//! [`ConnectionConfig`]: crate::ConnectionConfig
use serde::{Deserialize, Serialize};

/// default nsqd host used in direct mode
pub const DEFAULT_BROKER_HOST: &str = "127.0.0.1";
/// default nsqd TCP port
pub const DEFAULT_BROKER_PORT: u16 = 4150;
/// default reader in-flight cap
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 25;
/// default redelivery cap before a message is discarded
pub const DEFAULT_MAX_ATTEMPTS: u16 = 25;
/// default lookupd re-poll interval (ms)
pub const DEFAULT_POLL_INTERVAL: u64 = 10_000;
/// default client id reported to nsqd
pub const DEFAULT_CLIENT_ID: &str = "nsq-link";
/// default base requeue delay (ms)
pub const DEFAULT_REQUEUE_DELAY: u64 = 1_000;
/// default TCP connect timeout (ms)
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 5_000;
/// largest body nsqd accepts with its default `--max-msg-size`
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// `host:port` of each nsqlookupd. `null` and a missing key both mean absent
    #[serde(default)]
    pub discovery_addresses: Option<Vec<String>>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u16,
    /// absent means retry forever
    #[serde(default)]
    pub max_connection_attempts: Option<u32>,
    /// milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// milliseconds
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay: u64,
    /// milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// milliseconds, absent means wait for readiness forever
    #[serde(default)]
    pub startup_timeout: Option<u64>,
    /// bytes, bodies over this are refused before they reach the wire
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            discovery_addresses: None,
            max_in_flight: default_max_in_flight(),
            max_attempts: default_max_attempts(),
            max_connection_attempts: None,
            poll_interval: default_poll_interval(),
            topic: None,
            channel: None,
            client_id: default_client_id(),
            requeue_delay: default_requeue_delay(),
            connect_timeout: default_connect_timeout(),
            startup_timeout: None,
            max_message_size: default_max_message_size(),
        }
    }
}

pub fn default_broker_host() -> String {
    DEFAULT_BROKER_HOST.to_owned()
}

pub const fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}

pub const fn default_max_in_flight() -> u32 {
    DEFAULT_MAX_IN_FLIGHT
}

pub const fn default_max_attempts() -> u16 {
    DEFAULT_MAX_ATTEMPTS
}

pub const fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL
}

pub fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_owned()
}

pub const fn default_requeue_delay() -> u64 {
    DEFAULT_REQUEUE_DELAY
}

pub const fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

pub const fn default_max_message_size() -> u32 {
    DEFAULT_MAX_MESSAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_gets_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.broker_host, "127.0.0.1");
        assert_eq!(cfg.broker_port, 4150);
        assert_eq!(cfg.max_in_flight, 25);
        assert_eq!(cfg.max_attempts, 25);
        assert_eq!(cfg.poll_interval, 10_000);
        assert!(cfg.max_connection_attempts.is_none());
        assert_eq!(cfg.max_message_size, 1_048_576);
    }

    #[test]
    fn test_null_discovery_is_absent() {
        let cfg: Config =
            serde_json::from_str(r#"{"discovery_addresses": null, "topic": "events"}"#).unwrap();
        assert!(cfg.discovery_addresses.is_none());
        assert_eq!(cfg.topic.as_deref(), Some("events"));
    }

    #[test]
    fn test_out_of_range_port_rejected() {
        let res: Result<Config, _> = serde_json::from_str(r#"{"broker_port": 70000}"#);
        assert!(res.is_err());
    }
}
