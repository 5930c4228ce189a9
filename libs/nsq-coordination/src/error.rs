//! Error types for the NSQ lifecycle.
//!
//! Only configuration problems come back from `start`; connection failures
//! are absorbed and logged, and show up here only when an operation needs a
//! live sub-client (`publish`).

use std::time::Duration;

use config::ConfigError;
use nsq_client::ClientError;
use thiserror::Error;

/// Top-level error type for the nsq-coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Invalid or contradictory configuration, detected before any
    /// sub-client is created.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A sub-client operation failed.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// A reader-only operation was used on a writer-only system.
    #[error("no reader is configured")]
    ReaderDisabled,

    /// Shutdown was requested; the system is no longer usable.
    #[error("nsq system is shut down")]
    ShutDown,

    /// The payload is bigger than `max_message_size`; nothing was sent.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: u32 },

    /// Readiness was not reached within the caller's limit.
    #[error("nsq system not ready after {0:?}")]
    StartupTimeout(Duration),
}

impl CoordinationError {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinationError::Client(err) => err.is_retryable(),
            CoordinationError::StartupTimeout(_) => true,
            _ => false,
        }
    }

    /// Returns true if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, CoordinationError::Config(_))
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
