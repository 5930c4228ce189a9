//! The coordinator: builds the sub-clients from one resolved address set,
//! consumes their events on a single task and hands the host a
//! [`NsqSystem`] once everything is ready.
use std::{collections::VecDeque, fmt, future, sync::Arc, time::Duration};

use bytes::Bytes;
use config::{ConfigError, ConnectionConfig};
use nsq_client::{
    ClientEvent, ClientOptions, Connector, EventStream, Message, NsqConnector, Publisher,
    ReaderConfig, Role, SubClient,
};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, trace, warn};

use crate::{
    barrier::{ReadinessBarrier, ReadySignal, Transition},
    diagnostics::{DiagnosticsSink, SUBSYSTEM},
    error::{CoordinationError, CoordinationResult},
    handler::{self, MessageHandler},
    metrics,
    resolver::{self, AddressSet},
    shutdown::ShutdownCoordinator,
};

/// Messages held for a handler are touched this often, well inside nsqd's
/// default 60s `--msg-timeout`.
pub const HELD_TOUCH_INTERVAL: Duration = Duration::from_secs(30);

/// Connection state of one sub-client as seen from its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Ready,
    Error,
    Closed,
}

#[derive(Debug)]
pub(crate) struct ClientStates {
    writer: ClientState,
    reader: Option<ClientState>,
}

impl ClientStates {
    fn new(reader: bool) -> Self {
        Self {
            writer: ClientState::Connecting,
            reader: reader.then_some(ClientState::Connecting),
        }
    }

    fn get(&self, role: Role) -> Option<ClientState> {
        match role {
            Role::Writer => Some(self.writer),
            Role::Reader => self.reader,
        }
    }

    /// `Closed` is final
    pub(crate) fn set(&mut self, role: Role, state: ClientState) {
        let slot = match role {
            Role::Writer => &mut self.writer,
            Role::Reader => match &mut self.reader {
                Some(slot) => slot,
                None => return,
            },
        };
        if *slot != ClientState::Closed {
            *slot = state;
        }
    }
}

/// Options for nsqd connections derived from `config`.
pub fn client_options(config: &ConnectionConfig) -> ClientOptions {
    ClientOptions {
        client_id: config.client_id().to_owned(),
        connect_timeout: config.connect_timeout(),
        poll_interval: config.poll_interval(),
        ..ClientOptions::default()
    }
}

/// Builder for an [`NsqSystem`]. Writer-only unless [`with_reader`] is used.
///
/// [`with_reader`]: Coordinator::with_reader
pub struct Coordinator<C: Connector> {
    config: ConnectionConfig,
    connector: C,
    reader: bool,
}

impl<C: Connector> fmt::Debug for Coordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("reader", &self.reader)
            .finish_non_exhaustive()
    }
}

impl Coordinator<NsqConnector> {
    /// Coordinator talking to real nsqd/nsqlookupd.
    pub fn nsq(config: ConnectionConfig) -> Self {
        let connector = NsqConnector::new(client_options(&config));
        Self::new(config, connector)
    }
}

impl<C: Connector> Coordinator<C> {
    pub fn new(config: ConnectionConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            reader: false,
        }
    }

    /// Also create a reader for the configured topic/channel.
    pub fn with_reader(mut self) -> Self {
        self.reader = true;
        self
    }

    pub fn reader_enabled(&self) -> bool {
        self.reader
    }

    pub fn addresses(&self) -> AddressSet {
        resolver::resolve(&self.config)
    }

    /// Validate, resolve addresses and create the sub-clients, which start
    /// connecting right away. Only configuration problems fail here; wait on
    /// the returned [`Startup`] for readiness. Must run inside a tokio runtime.
    pub fn start(self) -> CoordinationResult<Startup<C>> {
        let Self {
            config,
            connector,
            reader,
        } = self;

        let reader_config = if reader {
            let channel = config
                .channel()
                .ok_or(ConfigError::MissingField("channel"))?;
            Some(ReaderConfig {
                topic: config.topic().to_owned(),
                channel: channel.to_owned(),
                max_in_flight: config.max_in_flight(),
                max_attempts: config.max_attempts(),
                max_connection_attempts: config.max_connection_attempts(),
                poll_interval: config.poll_interval(),
            })
        } else {
            None
        };

        let addresses = resolver::resolve(&config);
        info!(
            subsystem = SUBSYSTEM,
            mode = %addresses.mode(),
            addresses = ?addresses.addresses(),
            topic = config.topic(),
            reader,
            "starting nsq"
        );

        let (writer, writer_events) = connector.writer(addresses.endpoints());
        let writer = Arc::new(writer);
        let (reader, reader_events) = match reader_config {
            Some(reader_config) => {
                let (reader, events) = connector.reader(addresses.endpoints(), reader_config);
                (Some(Arc::new(reader)), Some(events))
            }
            None => (None, None),
        };

        let roles = if reader.is_some() {
            vec![Role::Writer, Role::Reader]
        } else {
            vec![Role::Writer]
        };
        let barrier = ReadinessBarrier::new(roles);
        let signal = barrier.signal();
        let states = Arc::new(Mutex::new(ClientStates::new(reader.is_some())));
        let token = CancellationToken::new();
        let shutdown = ShutdownCoordinator::new(
            writer.clone(),
            reader.clone().map(|r| r as Arc<dyn SubClient>),
            barrier.abandon_handle(),
            states.clone(),
            token.clone(),
        );

        let (control, control_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            barrier,
            diagnostics: DiagnosticsSink,
            states: states.clone(),
            handler: None,
            backlog: VecDeque::new(),
            requeue_delay: config.requeue_delay(),
            token,
        };
        tokio::spawn(
            event_loop
                .run(writer_events, reader_events, control_rx)
                .in_current_span(),
        );

        let system = NsqSystem {
            shared: Arc::new(Shared {
                writer,
                reader: reader.map(|r| r as Arc<dyn SubClient>),
                shutdown,
                control,
                states,
                signal: signal.clone(),
                max_message_size: config.max_message_size(),
            }),
        };
        Ok(Startup {
            system,
            signal,
            timeout: config.startup_timeout(),
        })
    }
}

/// A system whose sub-clients are still connecting.
pub struct Startup<C: Connector> {
    system: NsqSystem<C>,
    signal: ReadySignal,
    timeout: Option<Duration>,
}

impl<C: Connector> fmt::Debug for Startup<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Startup")
            .field("state", &self.signal.state())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Startup<C> {
    /// Handle to register as the host's pre-stop hook before waiting.
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.system.shared.shutdown.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.signal.is_satisfied()
    }

    pub fn readiness(&self) -> Readiness {
        self.system.readiness()
    }

    /// Wait until every sub-client is ready. Waits forever unless
    /// `startup_timeout` is configured; fails with `ShutDown` if shutdown
    /// comes first.
    pub async fn ready(self) -> CoordinationResult<NsqSystem<C>> {
        match self.timeout {
            Some(limit) => self.ready_within(limit).await,
            None => self.wait().await,
        }
    }

    /// [`ready`](Startup::ready) with an explicit limit. On timeout the
    /// sub-clients are shut down.
    pub async fn ready_within(self, limit: Duration) -> CoordinationResult<NsqSystem<C>> {
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| {
                warn!(subsystem = SUBSYSTEM, ?limit, "nsq not ready in time");
                CoordinationError::StartupTimeout(limit)
            })?
    }

    async fn wait(mut self) -> CoordinationResult<NsqSystem<C>> {
        self.signal.wait().await?;
        Ok(self.system)
    }
}

/// The running system: publish through the writer, consume through the
/// reader. Dropping the last clone shuts it down.
pub struct NsqSystem<C: Connector> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Connector> {
    writer: Arc<C::Writer>,
    reader: Option<Arc<dyn SubClient>>,
    shutdown: ShutdownCoordinator,
    control: mpsc::UnboundedSender<Control>,
    states: Arc<Mutex<ClientStates>>,
    signal: ReadySignal,
    max_message_size: u32,
}

impl<C: Connector> Drop for Shared<C> {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

impl<C: Connector> Clone for NsqSystem<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for NsqSystem<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NsqSystem")
            .field("writer", &self.shared.writer)
            .field("reader", &self.shared.reader)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<C: Connector> NsqSystem<C> {
    /// Publish `payload` on `topic` through the writer.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> CoordinationResult<()> {
        if self.shared.shutdown.is_shut_down() {
            return Err(CoordinationError::ShutDown);
        }
        if !config::is_valid_name(topic) {
            return Err(ConfigError::InvalidName {
                field: "topic",
                value: topic.to_owned(),
            }
            .into());
        }
        let payload = payload.into();
        if payload.len() > self.shared.max_message_size as usize {
            return Err(CoordinationError::MessageTooLarge {
                size: payload.len(),
                max: self.shared.max_message_size,
            });
        }
        trace!(subsystem = SUBSYSTEM, topic, len = payload.len(), "publishing");
        self.shared.writer.publish(topic, payload).await?;
        metrics::PUBLISHED.inc();
        Ok(())
    }

    /// Send reader messages to `handler`. Messages that arrived before any
    /// handler was set are handed over first, in arrival order. A later call
    /// replaces the handler.
    pub fn on_message<H: MessageHandler>(&self, handler: H) -> CoordinationResult<()> {
        if self.shared.reader.is_none() {
            return Err(CoordinationError::ReaderDisabled);
        }
        if self.shared.shutdown.is_shut_down() {
            return Err(CoordinationError::ShutDown);
        }
        self.shared
            .control
            .send(Control::Handler(Arc::new(handler)))
            .map_err(|_| CoordinationError::ShutDown)
    }

    /// `None` for the reader of a writer-only system.
    pub fn client_state(&self, role: Role) -> Option<ClientState> {
        self.shared.states.lock().get(role)
    }

    pub fn has_reader(&self) -> bool {
        self.shared.reader.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness().is_ready()
    }

    /// Readiness of this system alone, for status reporting.
    pub fn readiness(&self) -> Readiness {
        Readiness {
            signal: self.shared.signal.clone(),
            shutdown: self.shared.shutdown.clone(),
        }
    }

    /// See [`ShutdownCoordinator::shutdown`].
    pub fn shutdown(&self) -> bool {
        self.shared.shutdown.shutdown()
    }

    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shared.shutdown.clone()
    }
}

/// Clonable view of one system's readiness. Does not keep the system alive.
#[derive(Debug, Clone)]
pub struct Readiness {
    signal: ReadySignal,
    shutdown: ShutdownCoordinator,
}

impl Readiness {
    /// True once every sub-client has reported ready, until shutdown.
    pub fn is_ready(&self) -> bool {
        self.signal.is_satisfied() && !self.shutdown.is_shut_down()
    }
}

enum Control {
    Handler(Arc<dyn MessageHandler>),
}

/// Consumes both event streams on one task, so events are handled one at a
/// time while the two streams interleave freely.
struct EventLoop {
    barrier: ReadinessBarrier,
    diagnostics: DiagnosticsSink,
    states: Arc<Mutex<ClientStates>>,
    handler: Option<Arc<dyn MessageHandler>>,
    backlog: VecDeque<Message>,
    requeue_delay: Duration,
    token: CancellationToken,
}

async fn next_event(stream: &mut Option<EventStream>) -> Option<ClientEvent> {
    match stream {
        Some(stream) => stream.recv().await,
        None => future::pending().await,
    }
}

impl EventLoop {
    async fn run(
        mut self,
        mut writer: EventStream,
        mut reader: Option<EventStream>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        let mut writer_open = true;
        let mut touch = tokio::time::interval_at(
            Instant::now() + HELD_TOUCH_INTERVAL,
            HELD_TOUCH_INTERVAL,
        );
        touch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                Some(Control::Handler(handler)) = control.recv() => {
                    debug!(subsystem = SUBSYSTEM, queued = self.backlog.len(), "message handler registered");
                    self.handler = Some(handler);
                    self.replay().await;
                }
                event = writer.recv(), if writer_open => {
                    writer_open = self.on_event(Role::Writer, event).await;
                }
                event = next_event(&mut reader), if reader.is_some() => {
                    if !self.on_event(Role::Reader, event).await {
                        reader = None;
                    }
                }
                _ = touch.tick(), if !self.backlog.is_empty() => self.touch_backlog(),
                else => break,
            }
        }
        debug!(
            subsystem = SUBSYSTEM,
            unhandled = self.backlog.len(),
            "nsq event loop stopped"
        );
    }

    /// Returns false once the stream has nothing more to say.
    async fn on_event(&mut self, role: Role, event: Option<ClientEvent>) -> bool {
        let Some(event) = event else {
            self.states.lock().set(role, ClientState::Closed);
            return false;
        };
        match event {
            ClientEvent::Ready => {
                self.states.lock().set(role, ClientState::Ready);
                metrics::READY_EVENTS.role(role).inc();
                match self.barrier.arrive(role) {
                    Transition::Satisfied => {
                        metrics::SYSTEM_READY.inc();
                        info!(subsystem = SUBSYSTEM, %role, "nsq system ready");
                    }
                    Transition::Waiting { remaining } => {
                        info!(subsystem = SUBSYSTEM, %role, remaining, "nsq {role} ready");
                    }
                    Transition::Ignored => {
                        debug!(subsystem = SUBSYSTEM, %role, "repeated ready");
                    }
                }
            }
            ClientEvent::Error(err) => {
                self.states.lock().set(role, ClientState::Error);
                self.diagnostics.error(role, &err);
            }
            ClientEvent::Message(msg) => {
                metrics::MESSAGES.inc();
                self.deliver(msg).await;
            }
            ClientEvent::Discard(msg) => self.diagnostics.discard(&msg),
            ClientEvent::Closed => {
                self.states.lock().set(role, ClientState::Closed);
                info!(subsystem = SUBSYSTEM, %role, "nsq {role} closed");
                return false;
            }
        }
        true
    }

    async fn deliver(&mut self, msg: Message) {
        match self.handler.clone() {
            Some(handler) => self.handle(handler.as_ref(), msg).await,
            None => {
                trace!(subsystem = SUBSYSTEM, id = %msg.id(), "no handler yet, queueing message");
                self.backlog.push_back(msg);
            }
        }
    }

    /// Keep held messages from timing out on nsqd while no handler is set.
    fn touch_backlog(&self) {
        trace!(subsystem = SUBSYSTEM, held = self.backlog.len(), "touching held messages");
        for msg in &self.backlog {
            msg.touch();
        }
    }

    async fn replay(&mut self) {
        while let Some(msg) = self.backlog.pop_front() {
            let Some(handler) = self.handler.clone() else {
                self.backlog.push_front(msg);
                return;
            };
            self.handle(handler.as_ref(), msg).await;
        }
    }

    async fn handle(&self, handler: &dyn MessageHandler, msg: Message) {
        match handler.handle(&msg).await {
            Ok(()) => {
                if msg.finish() {
                    trace!(subsystem = SUBSYSTEM, id = %msg.id(), "message finished");
                }
            }
            Err(err) => {
                metrics::HANDLER_FAILURES.inc();
                let delay = handler::requeue_delay(self.requeue_delay, msg.attempts());
                warn!(
                    subsystem = SUBSYSTEM,
                    id = %msg.id(),
                    attempts = msg.attempts(),
                    ?delay,
                    error = %format!("{err:#}"),
                    "message handler failed, requeueing"
                );
                msg.requeue(delay);
            }
        }
    }
}
