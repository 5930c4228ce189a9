//! # config
//!
//! Connection options for the nsq-link lifecycle. [`wire::Config`] is what
//! gets deserialized; [`ConnectionConfig`] is the validated, immutable record
//! the rest of the workspace consumes.
use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tracing::debug;

pub mod wire;

/// upper bound of NSQ topic and channel names
pub const MAX_NAME_LEN: usize = 64;

const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Errors raised while loading or validating configuration. These are always
/// detected before any broker connection is attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `discovery_addresses` was given but contained nothing.
    #[error("discovery_addresses must contain at least one address when present")]
    EmptyDiscovery,

    /// An address did not parse as expected.
    #[error("invalid {field} address '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    /// A required field was not supplied.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// Topic or channel is not a legal NSQ name.
    #[error("invalid {field} name '{value}'")]
    InvalidName { field: &'static str, value: String },

    /// The document was neither valid JSON nor YAML for this schema.
    #[error("failed to decode config: {0}")]
    Decode(String),

    /// The config file could not be read.
    #[error("failed to read config at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Shorthand result alias for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Validated connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    broker_host: Ipv4Addr,
    broker_port: u16,
    discovery_addresses: Option<Vec<String>>,
    max_in_flight: u32,
    max_attempts: u16,
    max_connection_attempts: Option<u32>,
    poll_interval: Duration,
    topic: String,
    channel: Option<String>,
    client_id: String,
    requeue_delay: Duration,
    connect_timeout: Duration,
    startup_timeout: Option<Duration>,
    max_message_size: u32,
    path: Option<PathBuf>,
}

impl ConnectionConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse_str(s)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> ConfigResult<Self> {
        let s = s.as_ref();
        let wire: wire::Config = match serde_json::from_str(s) {
            Ok(wire) => wire,
            Err(json_err) => serde_yaml::from_str(s).map_err(|yaml_err| {
                ConfigError::Decode(format!("json: {json_err}, yaml: {yaml_err}"))
            })?,
        };
        let config = Self::try_from(wire)?;
        debug!(?config);
        Ok(config)
    }

    pub fn broker_host(&self) -> Ipv4Addr {
        self.broker_host
    }
    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }
    /// nsqlookupd addresses; when `Some` the list is never empty
    pub fn discovery_addresses(&self) -> Option<&[String]> {
        self.discovery_addresses.as_deref()
    }
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }
    /// `0` disables discarding
    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }
    /// `None` means unbounded
    pub fn max_connection_attempts(&self) -> Option<u32> {
        self.max_connection_attempts
    }
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
    pub fn topic(&self) -> &str {
        &self.topic
    }
    /// only required when a reader is enabled, checked by the coordinator
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
    pub fn requeue_delay(&self) -> Duration {
        self.requeue_delay
    }
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout
    }
    /// largest `publish` body in bytes
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl TryFrom<wire::Config> for ConnectionConfig {
    type Error = ConfigError;

    fn try_from(cfg: wire::Config) -> ConfigResult<Self> {
        let wire::Config {
            broker_host,
            broker_port,
            discovery_addresses,
            max_in_flight,
            max_attempts,
            max_connection_attempts,
            poll_interval,
            topic,
            channel,
            client_id,
            requeue_delay,
            connect_timeout,
            startup_timeout,
            max_message_size,
        } = cfg;

        let broker_host = broker_host
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::InvalidAddress {
                field: "broker_host",
                value: broker_host.clone(),
            })?;

        if let Some(addrs) = &discovery_addresses {
            if addrs.is_empty() {
                return Err(ConfigError::EmptyDiscovery);
            }
            for addr in addrs {
                validate_host_port(addr)?;
            }
        }

        let topic = topic.ok_or(ConfigError::MissingField("topic"))?;
        validate_name("topic", &topic)?;
        if let Some(channel) = &channel {
            validate_name("channel", channel)?;
        }
        if client_id.trim().is_empty() {
            return Err(ConfigError::MissingField("client_id"));
        }

        Ok(Self {
            broker_host,
            broker_port,
            discovery_addresses,
            max_in_flight,
            max_attempts,
            max_connection_attempts,
            poll_interval: Duration::from_millis(poll_interval),
            topic,
            channel,
            client_id,
            requeue_delay: Duration::from_millis(requeue_delay),
            connect_timeout: Duration::from_millis(connect_timeout),
            startup_timeout: startup_timeout.map(Duration::from_millis),
            max_message_size,
            path: None,
        })
    }
}

/// `host:port` with a non-empty host and a non-zero port
fn validate_host_port(addr: &str) -> ConfigResult<()> {
    let invalid = || ConfigError::InvalidAddress {
        field: "discovery",
        value: addr.to_owned(),
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(()),
        _ => Err(invalid()),
    }
}

/// Returns true if `name` is a legal NSQ topic or channel name
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn validate_name(field: &'static str, value: &str) -> ConfigResult<()> {
    if is_valid_name(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            field,
            value: value.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn with_topic() -> wire::Config {
        wire::Config {
            topic: Some("events".into()),
            ..wire::Config::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        let cfg = ConnectionConfig::try_from(with_topic()).unwrap();
        assert_eq!(cfg.broker_host(), Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(cfg.broker_port(), 4150);
        assert!(cfg.discovery_addresses().is_none());
        assert_eq!(cfg.max_in_flight(), 25);
        assert_eq!(cfg.max_attempts(), 25);
        assert_eq!(cfg.max_connection_attempts(), None);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(10));
        assert_eq!(cfg.topic(), "events");
        assert_eq!(cfg.channel(), None);
        assert_eq!(cfg.startup_timeout(), None);
        assert_eq!(cfg.max_message_size(), 1_048_576);
    }

    #[test]
    fn test_missing_topic() {
        let err = ConnectionConfig::try_from(wire::Config::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("topic")));
    }

    #[test]
    fn test_malformed_host_rejected() {
        let cfg = wire::Config {
            broker_host: "localhost".into(),
            ..with_topic()
        };
        let err = ConnectionConfig::try_from(cfg).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidAddress {
                field: "broker_host",
                ..
            }
        ));
    }

    #[test]
    fn test_empty_discovery_rejected() {
        let cfg = wire::Config {
            discovery_addresses: Some(vec![]),
            ..with_topic()
        };
        let err = ConnectionConfig::try_from(cfg).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyDiscovery));
    }

    #[test]
    fn test_discovery_addresses_checked() {
        for bad in ["127.0.0.1", ":4161", "127.0.0.1:", "127.0.0.1:0", "a b:4161"] {
            let cfg = wire::Config {
                discovery_addresses: Some(vec![bad.into()]),
                ..with_topic()
            };
            assert!(
                ConnectionConfig::try_from(cfg).is_err(),
                "{bad} should be rejected"
            );
        }
        let cfg = wire::Config {
            discovery_addresses: Some(vec!["127.0.0.1:5000".into(), "128.0.0.1:5000".into()]),
            ..with_topic()
        };
        let cfg = ConnectionConfig::try_from(cfg).unwrap();
        assert_eq!(
            cfg.discovery_addresses(),
            Some(&["127.0.0.1:5000".to_owned(), "128.0.0.1:5000".to_owned()][..])
        );
    }

    #[test]
    fn test_names() {
        assert!(is_valid_name("events"));
        assert!(is_valid_name("a.b_c-d"));
        assert!(is_valid_name("events#ephemeral"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("#ephemeral"));
        assert!(!is_valid_name("with space"));
        assert!(!is_valid_name(&"x".repeat(65)));

        let cfg = wire::Config {
            channel: Some("bad channel".into()),
            ..with_topic()
        };
        let err = ConnectionConfig::try_from(cfg).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidName { field: "channel", .. }));
    }

    #[test]
    fn test_parse_str_json_and_yaml() {
        let json = r#"{"broker_host": "127.0.0.2", "broker_port": 5000, "topic": "events"}"#;
        let cfg = ConnectionConfig::parse_str(json).unwrap();
        assert_eq!(cfg.broker_host(), Ipv4Addr::new(127, 0, 0, 2));
        assert_eq!(cfg.broker_port(), 5000);

        let yaml = "
topic: events
channel: workers
discovery_addresses:
  - 127.0.0.1:5000
  - 128.0.0.1:5000
max_connection_attempts: 3
startup_timeout: 2500
";
        let cfg = ConnectionConfig::parse_str(yaml).unwrap();
        assert_eq!(cfg.channel(), Some("workers"));
        assert_eq!(cfg.discovery_addresses().map(<[_]>::len), Some(2));
        assert_eq!(cfg.max_connection_attempts(), Some(3));
        assert_eq!(cfg.startup_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_parse_garbage() {
        let err = ConnectionConfig::parse_str("topic: [unterminated").unwrap_err();
        assert!(matches!(err, ConfigError::Decode(_)));
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "topic: events").unwrap();
        let cfg = ConnectionConfig::parse(file.path()).unwrap();
        assert_eq!(cfg.topic(), "events");
        assert_eq!(cfg.path(), Some(file.path()));

        let err = ConnectionConfig::parse("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
