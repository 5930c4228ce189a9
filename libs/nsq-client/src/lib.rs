//! # nsq-client
//!
//! Writer and Reader sub-clients for NSQ. Both start connecting as soon as
//! they are created and report what happens to them on an [`EventStream`]:
//! `Ready` when a connection is up, `Error` for every failure they recover
//! from (or give up on), and for readers `Message`/`Discard` for deliveries.
//!
//! Two backends implement the [`Connector`] seam: [`NsqConnector`] talks the
//! NSQ TCP protocol to nsqd (directly or found through nsqlookupd) and
//! [`memory::MemoryBroker`] is an in-process broker.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

pub mod error;
pub mod event;
pub mod lookup;
pub mod memory;
pub mod message;
pub mod protocol;

mod conn;
mod pool;
mod reader;
mod writer;

pub use crate::{
    error::{ClientError, ClientResult},
    event::{ClientEvent, EventStream},
    message::{Message, MessageId, RawMessage, Responder},
    reader::Reader,
    writer::Writer,
};

/// default heartbeat interval requested in IDENTIFY
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Which half of the system a sub-client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Writer,
    Reader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Writer => "writer",
            Role::Reader => "reader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a sub-client finds its brokers. Addresses are `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoints {
    /// nsqd TCP addresses, connected to as given
    Nsqd(Vec<String>),
    /// nsqlookupd HTTP addresses, polled for nsqd producers
    Lookupd(Vec<String>),
}

impl Endpoints {
    pub fn addresses(&self) -> &[String] {
        match self {
            Endpoints::Nsqd(addrs) | Endpoints::Lookupd(addrs) => addrs,
        }
    }

    pub fn is_discovery(&self) -> bool {
        matches!(self, Endpoints::Lookupd(_))
    }
}

/// Options shared by every connection a connector opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// reported to nsqd in IDENTIFY
    pub client_id: String,
    /// bounds TCP connect plus handshake
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// how often a writer re-polls nsqlookupd `/nodes`
    pub poll_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: "nsq-link".to_owned(),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Subscription settings for a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    pub topic: String,
    pub channel: String,
    /// total messages in flight across all connections
    pub max_in_flight: u32,
    /// deliveries beyond this are discarded, `0` disables
    pub max_attempts: u16,
    /// consecutive failed connects before a connection is given up, `None` retries forever
    pub max_connection_attempts: Option<u32>,
    /// how often nsqlookupd is re-polled for producers
    pub poll_interval: Duration,
}

/// Capabilities every sub-client has.
pub trait SubClient: Send + Sync + fmt::Debug + 'static {
    fn role(&self) -> Role;

    /// Stop the sub-client. Returns immediately; teardown continues in the
    /// background and ends with a `Closed` event. Calling it again does nothing.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A sub-client that can publish.
#[async_trait]
pub trait Publisher: SubClient {
    /// Resolves once the broker accepted the message.
    async fn publish(&self, topic: &str, body: Bytes) -> ClientResult<()>;
}

/// Builds sub-clients. Creating one starts its connection attempts, so it
/// must happen inside a tokio runtime.
pub trait Connector: Send + Sync + 'static {
    type Writer: Publisher;
    type Reader: SubClient;

    fn writer(&self, endpoints: Endpoints) -> (Self::Writer, EventStream);

    fn reader(&self, endpoints: Endpoints, config: ReaderConfig) -> (Self::Reader, EventStream);
}

/// [`Connector`] for real nsqd/nsqlookupd deployments.
#[derive(Debug, Clone, Default)]
pub struct NsqConnector {
    options: Arc<ClientOptions>,
}

impl NsqConnector {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }
}

impl Connector for NsqConnector {
    type Writer = Writer;
    type Reader = Reader;

    fn writer(&self, endpoints: Endpoints) -> (Writer, EventStream) {
        Writer::connect(endpoints, self.options.clone())
    }

    fn reader(&self, endpoints: Endpoints, config: ReaderConfig) -> (Reader, EventStream) {
        Reader::connect(endpoints, config, self.options.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        let direct = Endpoints::Nsqd(vec!["127.0.0.2:5000".into()]);
        assert!(!direct.is_discovery());
        assert_eq!(direct.addresses(), ["127.0.0.2:5000".to_owned()]);

        let lookup = Endpoints::Lookupd(vec!["a:4161".into(), "b:4161".into()]);
        assert!(lookup.is_discovery());
        assert_eq!(lookup.addresses().len(), 2);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Writer.to_string(), "writer");
        assert_eq!(Role::Reader.as_str(), "reader");
    }
}
