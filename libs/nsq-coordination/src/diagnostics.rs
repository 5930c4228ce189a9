//! Where sub-client errors and discarded messages end up.
use nsq_client::{ClientError, Message, Role};
use tracing::{debug, error, warn};

use crate::metrics;

/// tag carried by every diagnostics record
pub const SUBSYSTEM: &str = "nsq";

/// Logs errors and discards; never fails and never blocks readiness.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticsSink;

impl DiagnosticsSink {
    pub fn error(&self, role: Role, err: &ClientError) {
        metrics::CLIENT_ERRORS.role(role).inc();
        if err.is_retryable() || err.is_soft_broker_error() {
            warn!(subsystem = SUBSYSTEM, %role, %err, "nsq {role} error");
        } else {
            error!(subsystem = SUBSYSTEM, %role, %err, "nsq {role} error");
        }
    }

    /// Log the payload of a message that ran out of attempts, then finish it
    /// so it is not delivered again.
    pub fn discard(&self, msg: &Message) {
        metrics::DISCARDS.inc();
        warn!(
            subsystem = SUBSYSTEM,
            id = %msg.id(),
            attempts = msg.attempts(),
            payload = %String::from_utf8_lossy(msg.body()),
            "discarding message after max attempts"
        );
        if !msg.finish() {
            debug!(subsystem = SUBSYSTEM, id = %msg.id(), "discarded message was already responded to");
        }
    }
}
