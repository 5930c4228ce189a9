//! Lifecycle events a sub-client reports to its owner.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::mpsc;
use tracing::trace;

use crate::{error::ClientError, message::Message};

/// Something that happened to a sub-client.
#[derive(Debug)]
pub enum ClientEvent {
    /// A broker connection is up. Sent again after a full reconnect.
    Ready,
    /// A failure the sub-client absorbed (or gave up on).
    Error(ClientError),
    /// A delivery for a reader.
    Message(Message),
    /// A delivery that exceeded `max_attempts`; it still has to be finished.
    Discard(Message),
    /// The sub-client has stopped; nothing follows.
    Closed,
}

/// Receiving side of a sub-client's events.
pub type EventStream = mpsc::UnboundedReceiver<ClientEvent>;

/// Sending side, shared by every task of one sub-client.
#[derive(Debug, Clone)]
pub(crate) struct Events {
    tx: mpsc::UnboundedSender<ClientEvent>,
    closed: Arc<AtomicBool>,
}

impl Events {
    pub(crate) fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    fn emit(&self, event: ClientEvent) {
        if self.closed.load(Ordering::Acquire) {
            trace!(?event, "event after close dropped");
            return;
        }
        // owner went away, nobody left to tell
        let _ = self.tx.send(event);
    }

    pub(crate) fn ready(&self) {
        self.emit(ClientEvent::Ready);
    }

    pub(crate) fn error(&self, err: ClientError) {
        self.emit(ClientEvent::Error(err));
    }

    pub(crate) fn message(&self, msg: Message) {
        self.emit(ClientEvent::Message(msg));
    }

    pub(crate) fn discard(&self, msg: Message) {
        self.emit(ClientEvent::Discard(msg));
    }

    /// Sends `Closed` the first time only.
    pub(crate) fn closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(ClientEvent::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nothing_after_closed() {
        let (events, mut rx) = Events::channel();
        events.ready();
        events.closed();
        events.closed();
        events.error(ClientError::Closed);

        assert!(matches!(rx.recv().await, Some(ClientEvent::Ready)));
        assert!(matches!(rx.recv().await, Some(ClientEvent::Closed)));
        drop(events);
        assert!(rx.recv().await.is_none());
    }
}
