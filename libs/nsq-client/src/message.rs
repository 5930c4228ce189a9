//! Delivered messages and the way they are acknowledged.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;

const ID_LEN: usize = 16;

/// 16 byte message id assigned by nsqd
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; ID_LEN]);

impl MessageId {
    /// length of an id on the wire
    pub const LEN: usize = ID_LEN;

    pub fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Returns `None` unless `bytes` is exactly [`MessageId::LEN`] long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; Self::LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl From<u64> for MessageId {
    /// zero padded lower-case hex, the way nsqd renders its own ids
    fn from(n: u64) -> Self {
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(format!("{n:016x}").as_bytes());
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// A message as it arrives off the wire, before it is bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// nanoseconds since the unix epoch
    pub timestamp: i64,
    /// delivery count, starting at 1
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

/// Where FIN/REQ/TOUCH for a message are sent.
pub trait Responder: Send + Sync + fmt::Debug + 'static {
    fn finish(&self, id: MessageId);
    fn requeue(&self, id: MessageId, delay: Duration);
    fn touch(&self, id: MessageId);
}

/// A delivered message. Exactly one of [`finish`] or [`requeue`] takes
/// effect; later calls are no-ops.
///
/// [`finish`]: Message::finish
/// [`requeue`]: Message::requeue
pub struct Message {
    raw: RawMessage,
    responder: Arc<dyn Responder>,
    responded: AtomicBool,
}

impl Message {
    pub fn new(raw: RawMessage, responder: Arc<dyn Responder>) -> Self {
        Self {
            raw,
            responder,
            responded: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> MessageId {
        self.raw.id
    }

    pub fn attempts(&self) -> u16 {
        self.raw.attempts
    }

    pub fn timestamp(&self) -> i64 {
        self.raw.timestamp
    }

    pub fn body(&self) -> &Bytes {
        &self.raw.body
    }

    /// Acknowledge the message so it is not redelivered. Returns false if the
    /// message was already responded to.
    pub fn finish(&self) -> bool {
        if self.responded.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.responder.finish(self.raw.id);
        true
    }

    /// Hand the message back for redelivery after `delay`. Returns false if
    /// the message was already responded to.
    pub fn requeue(&self, delay: Duration) -> bool {
        if self.responded.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.responder.requeue(self.raw.id, delay);
        true
    }

    /// Reset the broker-side timeout for a message still being worked on.
    pub fn touch(&self) {
        if !self.is_responded() {
            self.responder.touch(self.raw.id);
        }
    }

    pub fn is_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.raw.id)
            .field("attempts", &self.raw.attempts)
            .field("timestamp", &self.raw.timestamp)
            .field("body_len", &self.raw.body.len())
            .field("responded", &self.is_responded())
            .finish()
    }
}
