//! In-process broker behind the same [`Connector`] seam as nsqd.
//!
//! Topics fan out to channels, channels spread messages round-robin over
//! their subscribers, and a message stays in flight until it is finished or
//! requeued. Attempts are counted the way nsqd counts them. Messages never
//! time out, so TOUCH does nothing.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::{
    Connector, Endpoints, Publisher, ReaderConfig, Role, SubClient,
    error::{ClientError, ClientResult},
    event::{EventStream, Events},
    message::{Message, MessageId, RawMessage, Responder},
    reader,
};

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    next_subscriber: u64,
    topics: HashMap<String, Topic>,
}

#[derive(Debug, Default)]
struct Topic {
    /// held until the first channel exists
    backlog: VecDeque<RawMessage>,
    channels: HashMap<String, Channel>,
}

#[derive(Debug)]
struct Channel {
    backlog: VecDeque<RawMessage>,
    in_flight: HashMap<MessageId, (u64, RawMessage)>,
    /// requeued with a delay that has not elapsed yet
    deferred: usize,
    subscribers: Vec<Subscriber>,
    next: usize,
    responder: Arc<MemoryResponder>,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    events: Events,
    max_in_flight: u32,
    max_attempts: u16,
    in_flight: u32,
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

impl State {
    fn channel_mut(&mut self, topic: &str, channel: &str) -> Option<&mut Channel> {
        self.topics.get_mut(topic)?.channels.get_mut(channel)
    }
}

impl Channel {
    fn new(responder: Arc<MemoryResponder>) -> Self {
        Self {
            backlog: VecDeque::new(),
            in_flight: HashMap::new(),
            deferred: 0,
            subscribers: Vec::new(),
            next: 0,
            responder,
        }
    }

    /// next subscriber with room, round-robin
    fn pick(&mut self) -> Option<usize> {
        let n = self.subscribers.len();
        for i in 0..n {
            let idx = (self.next + i) % n;
            let sub = &self.subscribers[idx];
            if sub.in_flight < sub.max_in_flight.max(1) {
                self.next = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    /// Deliver as much of the backlog as subscribers have room for.
    fn pump(&mut self) {
        while !self.backlog.is_empty() {
            let Some(idx) = self.pick() else {
                break;
            };
            let Some(mut raw) = self.backlog.pop_front() else {
                break;
            };
            raw.attempts = raw.attempts.saturating_add(1);
            let sub = &mut self.subscribers[idx];
            sub.in_flight += 1;
            self.in_flight.insert(raw.id, (sub.id, raw.clone()));
            trace!(id = %raw.id, attempts = raw.attempts, subscriber = sub.id, "delivering");
            reader::dispatch(
                &sub.events,
                sub.max_attempts,
                Message::new(raw, self.responder.clone()),
            );
        }
    }

    /// Take `id` out of flight, freeing a slot of the subscriber holding it.
    fn settle(&mut self, id: MessageId) -> Option<RawMessage> {
        let (sub_id, raw) = self.in_flight.remove(&id)?;
        if let Some(sub) = self.subscribers.iter_mut().find(|s| s.id == sub_id) {
            sub.in_flight = sub.in_flight.saturating_sub(1);
        }
        Some(raw)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `body` on `topic`, creating the topic if needed.
    pub fn publish(&self, topic: &str, body: Bytes) {
        let mut state = self.state.lock();
        state.next_id += 1;
        let raw = RawMessage {
            timestamp: now_nanos(),
            attempts: 0,
            id: MessageId::from(state.next_id),
            body,
        };
        let topic = state.topics.entry(topic.to_owned()).or_default();
        if topic.channels.is_empty() {
            topic.backlog.push_back(raw);
            return;
        }
        for channel in topic.channels.values_mut() {
            channel.backlog.push_back(raw.clone());
            channel.pump();
        }
    }

    /// messages waiting for delivery on a channel
    pub fn depth(&self, topic: &str, channel: &str) -> usize {
        self.with_channel(topic, channel, |c| c.backlog.len())
    }

    /// messages delivered and not yet finished or requeued
    pub fn in_flight(&self, topic: &str, channel: &str) -> usize {
        self.with_channel(topic, channel, |c| c.in_flight.len())
    }

    /// messages requeued with a delay that has not elapsed
    pub fn deferred(&self, topic: &str, channel: &str) -> usize {
        self.with_channel(topic, channel, |c| c.deferred)
    }

    /// messages published to a topic that has no channel yet
    pub fn topic_depth(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.backlog.len())
    }

    fn with_channel(&self, topic: &str, channel: &str, f: impl FnOnce(&Channel) -> usize) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.channels.get(channel))
            .map_or(0, f)
    }

    fn subscribe(&self, config: &ReaderConfig, events: Events) -> u64 {
        let mut state = self.state.lock();
        state.next_subscriber += 1;
        let id = state.next_subscriber;
        let responder = Arc::new(MemoryResponder {
            state: Arc::downgrade(&self.state),
            topic: config.topic.clone(),
            channel: config.channel.clone(),
        });

        let topic = state.topics.entry(config.topic.clone()).or_default();
        let first_channel = topic.channels.is_empty();
        let channel = topic
            .channels
            .entry(config.channel.clone())
            .or_insert_with(|| Channel::new(responder));
        if first_channel {
            channel.backlog.extend(topic.backlog.drain(..));
        }
        channel.subscribers.push(Subscriber {
            id,
            events,
            max_in_flight: config.max_in_flight,
            max_attempts: config.max_attempts,
            in_flight: 0,
        });
        debug!(topic = %config.topic, channel = %config.channel, subscriber = id, "subscribed");
        channel.pump();
        id
    }

    /// Drop a subscriber; whatever it still held goes back to the front of the queue.
    fn unsubscribe(&self, topic: &str, channel: &str, id: u64) {
        let mut state = self.state.lock();
        let Some(channel) = state.channel_mut(topic, channel) else {
            return;
        };
        channel.subscribers.retain(|s| s.id != id);
        let held = channel
            .in_flight
            .iter()
            .filter(|(_, (sub, _))| *sub == id)
            .map(|(msg_id, _)| *msg_id)
            .collect::<Vec<_>>();
        for msg_id in held {
            if let Some((_, raw)) = channel.in_flight.remove(&msg_id) {
                channel.backlog.push_front(raw);
            }
        }
        channel.next = 0;
        debug!(topic, subscriber = id, "unsubscribed");
        channel.pump();
    }
}

#[derive(Debug)]
struct MemoryResponder {
    state: Weak<Mutex<State>>,
    topic: String,
    channel: String,
}

impl MemoryResponder {
    fn with_channel(&self, f: impl FnOnce(&mut Channel)) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock();
        if let Some(channel) = state.channel_mut(&self.topic, &self.channel) {
            f(channel);
        }
    }
}

impl Responder for MemoryResponder {
    fn finish(&self, id: MessageId) {
        self.with_channel(|channel| {
            if channel.settle(id).is_some() {
                trace!(%id, "finished");
                channel.pump();
            }
        });
    }

    fn requeue(&self, id: MessageId, delay: Duration) {
        let mut later = None;
        self.with_channel(|channel| {
            let Some(raw) = channel.settle(id) else {
                return;
            };
            trace!(%id, ?delay, "requeued");
            if delay.is_zero() || Handle::try_current().is_err() {
                channel.backlog.push_back(raw);
                channel.pump();
            } else {
                channel.deferred += 1;
                later = Some(raw);
            }
        });

        if let Some(raw) = later {
            let state = self.state.clone();
            let topic = self.topic.clone();
            let channel = self.channel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(state) = state.upgrade() else {
                    return;
                };
                let mut state = state.lock();
                if let Some(channel) = state.channel_mut(&topic, &channel) {
                    channel.deferred = channel.deferred.saturating_sub(1);
                    channel.backlog.push_back(raw);
                    channel.pump();
                }
            });
        }
    }

    fn touch(&self, _id: MessageId) {}
}

/// Writer half of the in-process broker.
#[derive(Debug)]
pub struct MemoryWriter {
    broker: MemoryBroker,
    events: Events,
    closed: AtomicBool,
}

impl SubClient for MemoryWriter {
    fn role(&self) -> Role {
        Role::Writer
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.events.closed();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Publisher for MemoryWriter {
    async fn publish(&self, topic: &str, body: Bytes) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.broker.publish(topic, body);
        Ok(())
    }
}

/// Reader half of the in-process broker.
#[derive(Debug)]
pub struct MemoryReader {
    broker: MemoryBroker,
    topic: String,
    channel: String,
    subscriber: u64,
    events: Events,
    closed: AtomicBool,
}

impl SubClient for MemoryReader {
    fn role(&self) -> Role {
        Role::Reader
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker
                .unsubscribe(&self.topic, &self.channel, self.subscriber);
            self.events.closed();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl Connector for MemoryBroker {
    type Writer = MemoryWriter;
    type Reader = MemoryReader;

    fn writer(&self, endpoints: Endpoints) -> (MemoryWriter, EventStream) {
        debug!(?endpoints, "in-process writer ignores endpoints");
        let (events, stream) = Events::channel();
        events.ready();
        let writer = MemoryWriter {
            broker: self.clone(),
            events,
            closed: AtomicBool::new(false),
        };
        (writer, stream)
    }

    fn reader(&self, endpoints: Endpoints, config: ReaderConfig) -> (MemoryReader, EventStream) {
        debug!(?endpoints, "in-process reader ignores endpoints");
        let (events, stream) = Events::channel();
        events.ready();
        let subscriber = self.subscribe(&config, events.clone());
        let reader = MemoryReader {
            broker: self.clone(),
            topic: config.topic,
            channel: config.channel,
            subscriber,
            events,
            closed: AtomicBool::new(false),
        };
        (reader, stream)
    }
}
