//! Turns a [`ConnectionConfig`] into the broker addresses both sub-clients use.
use std::{fmt, net::Ipv4Addr};

use config::ConnectionConfig;
use nsq_client::Endpoints;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// one fixed nsqd
    Direct,
    /// nsqlookupd addresses, nsqd producers found at runtime
    Discovery,
}

impl AddressMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressMode::Direct => "direct",
            AddressMode::Discovery => "discovery",
        }
    }
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved addressing. One set feeds both the writer and the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSet {
    mode: AddressMode,
    addresses: Vec<String>,
}

impl AddressSet {
    /// Discovery wins whenever a non-empty list is given; otherwise the
    /// direct `host:port` is used.
    pub fn from_parts(host: Ipv4Addr, port: u16, discovery: Option<&[String]>) -> Self {
        match discovery {
            Some(addrs) if !addrs.is_empty() => Self {
                mode: AddressMode::Discovery,
                addresses: addrs.to_vec(),
            },
            _ => Self {
                mode: AddressMode::Direct,
                addresses: vec![format!("{host}:{port}")],
            },
        }
    }

    pub fn mode(&self) -> AddressMode {
        self.mode
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// what a sub-client is built with
    pub fn endpoints(&self) -> Endpoints {
        match self.mode {
            AddressMode::Direct => Endpoints::Nsqd(self.addresses.clone()),
            AddressMode::Discovery => Endpoints::Lookupd(self.addresses.clone()),
        }
    }
}

pub fn resolve(config: &ConnectionConfig) -> AddressSet {
    AddressSet::from_parts(
        config.broker_host(),
        config.broker_port(),
        config.discovery_addresses(),
    )
}
