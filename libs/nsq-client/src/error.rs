//! Error types for NSQ sub-client operations.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by writers, readers and their connections.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket-level failure on an established or connecting stream.
    #[error("io error on {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP connect did not finish in time.
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// nsqd answered with an `E_*` error frame.
    #[error("broker error: {0}")]
    Broker(String),

    /// The peer sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// nsqlookupd could not be queried or answered garbage.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// No live connection is available for the operation.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The connection went away while a response was outstanding.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// `max_connection_attempts` consecutive connects failed.
    #[error("giving up on {addr} after {attempts} attempt(s)")]
    AttemptsExhausted { addr: String, attempts: u32 },

    /// The sub-client was closed.
    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Returns true if the failure is transient and the client keeps retrying
    /// on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io { .. }
                | ClientError::ConnectTimeout { .. }
                | ClientError::Lookup(_)
                | ClientError::NotConnected(_)
                | ClientError::ConnectionLost(_)
        )
    }

    /// Returns true for broker errors nsqd does not close the connection for.
    pub fn is_soft_broker_error(&self) -> bool {
        match self {
            ClientError::Broker(msg) => {
                msg.starts_with("E_FIN_FAILED")
                    || msg.starts_with("E_REQ_FAILED")
                    || msg.starts_with("E_TOUCH_FAILED")
            }
            _ => false,
        }
    }
}

/// Shorthand result alias for sub-client operations.
pub type ClientResult<T> = Result<T, ClientError>;
