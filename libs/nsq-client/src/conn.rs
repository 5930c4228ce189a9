//! One nsqd connection: handshake, command/response plumbing and reconnect
//! with exponential backoff.
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tokio_util::{codec::Framed, sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    ClientOptions, ReaderConfig, Role,
    error::{ClientError, ClientResult},
    event::Events,
    message::{Message, MessageId, Responder},
    protocol::{CLOSE_WAIT, Command, Frame, HEARTBEAT, Identify, MAGIC_V2, NsqCodec, OK},
    reader,
};

/// Base delay between reconnect attempts.
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for reconnect backoff.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// How long a closing reader waits for `CLOSE_WAIT`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("nsq-link/", env!("CARGO_PKG_VERSION"));

type Transport = Framed<TcpStream, NsqCodec>;

pub(crate) enum Outgoing {
    /// fire and forget
    Command(Command),
    /// answered by the next response or error frame
    Request(Command, oneshot::Sender<ClientResult<Bytes>>),
}

/// What a connection tells its pool.
#[derive(Debug)]
pub(crate) enum Notice {
    Up(String),
    Down(String),
    /// gave up after `max_connection_attempts`
    Gone(String),
}

#[derive(Debug, Clone)]
pub(crate) enum Session {
    Writer,
    Reader(Arc<ReaderConfig>),
}

impl Session {
    pub(crate) fn role(&self) -> Role {
        match self {
            Session::Writer => Role::Writer,
            Session::Reader(_) => Role::Reader,
        }
    }
}

/// Everything the connections of one sub-client have in common.
#[derive(Debug)]
pub(crate) struct ConnShared {
    pub(crate) session: Session,
    pub(crate) options: Arc<ClientOptions>,
    pub(crate) max_connection_attempts: Option<u32>,
    pub(crate) events: Events,
    pub(crate) notices: mpsc::UnboundedSender<Notice>,
}

/// Pool-side handle of a connection task.
#[derive(Debug, Clone)]
pub(crate) struct ConnHandle {
    addr: Arc<str>,
    tx: mpsc::UnboundedSender<Outgoing>,
    live: Arc<AtomicBool>,
    rdy: Arc<AtomicU32>,
}

impl ConnHandle {
    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// handshake done and not (yet) lost
    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn send(&self, cmd: Command) -> bool {
        self.tx.send(Outgoing::Command(cmd)).is_ok()
    }

    pub(crate) async fn request(&self, cmd: Command) -> ClientResult<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Outgoing::Request(cmd, reply))
            .map_err(|_| ClientError::ConnectionLost(self.addr.to_string()))?;
        rx.await
            .map_err(|_| ClientError::ConnectionLost(self.addr.to_string()))?
    }

    /// Store the RDY count used for this connection, sending it right away if
    /// the connection is up. Reconnects re-send the stored count.
    pub(crate) fn set_rdy(&self, count: u32) {
        if self.rdy.swap(count, Ordering::AcqRel) != count && self.is_live() {
            self.send(Command::Rdy(count));
        }
    }
}

/// Start a connection task for `addr`.
pub(crate) fn spawn(
    addr: String,
    shared: Arc<ConnShared>,
    rdy: u32,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) -> ConnHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Connection {
        addr: addr.into(),
        shared,
        tx: tx.clone(),
        live: Arc::new(AtomicBool::new(false)),
        rdy: Arc::new(AtomicU32::new(rdy)),
        generation: Arc::new(AtomicU64::new(0)),
    };
    let handle = ConnHandle {
        addr: conn.addr.clone(),
        tx,
        live: conn.live.clone(),
        rdy: conn.rdy.clone(),
    };
    tracker.spawn(conn.run(rx, cancel));
    handle
}

/// Sends FIN/REQ/TOUCH for messages delivered on one connection generation.
/// Once the connection is replaced nsqd has already requeued those messages,
/// so responses for them are dropped.
#[derive(Debug)]
struct ConnResponder {
    addr: Arc<str>,
    tx: mpsc::UnboundedSender<Outgoing>,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl ConnResponder {
    fn send(&self, cmd: Command) {
        if self.current.load(Ordering::Acquire) != self.generation {
            debug!(addr = %self.addr, cmd = cmd.name(), "connection was replaced, response dropped");
            return;
        }
        let _ = self.tx.send(Outgoing::Command(cmd));
    }
}

impl Responder for ConnResponder {
    fn finish(&self, id: MessageId) {
        self.send(Command::Fin(id));
    }

    fn requeue(&self, id: MessageId, delay: Duration) {
        self.send(Command::Req { id, timeout: delay });
    }

    fn touch(&self, id: MessageId) {
        self.send(Command::Touch(id));
    }
}

struct Connection {
    addr: Arc<str>,
    shared: Arc<ConnShared>,
    tx: mpsc::UnboundedSender<Outgoing>,
    live: Arc<AtomicBool>,
    rdy: Arc<AtomicU32>,
    generation: Arc<AtomicU64>,
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(5);
    RECONNECT_BASE_DELAY
        .saturating_mul(1 << exp)
        .min(MAX_RECONNECT_DELAY)
}

impl Connection {
    fn io(&self, source: std::io::Error) -> ClientError {
        ClientError::Io {
            addr: self.addr.to_string(),
            source,
        }
    }

    fn role(&self) -> Role {
        self.shared.session.role()
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Outgoing>, cancel: CancellationToken) {
        let mut failures = 0u32;
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.connect() => res,
            };
            match attempt {
                Ok(transport) => {
                    failures = 0;
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    let responder = Arc::new(ConnResponder {
                        addr: self.addr.clone(),
                        tx: self.tx.clone(),
                        generation,
                        current: self.generation.clone(),
                    });
                    self.live.store(true, Ordering::Release);
                    info!(addr = %self.addr, role = %self.role(), generation, "connected to nsqd");
                    let _ = self.shared.notices.send(Notice::Up(self.addr.to_string()));

                    let end = self.serve(transport, &mut rx, &responder, &cancel).await;

                    self.live.store(false, Ordering::Release);
                    let _ = self.shared.notices.send(Notice::Down(self.addr.to_string()));
                    self.drain(&mut rx);
                    match end {
                        Ok(()) => {
                            info!(addr = %self.addr, role = %self.role(), "nsqd connection closed");
                            break;
                        }
                        Err(err) => {
                            warn!(addr = %self.addr, role = %self.role(), ?err, "nsqd connection lost");
                            self.shared.events.error(err);
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(addr = %self.addr, role = %self.role(), attempt = failures, ?err, "nsqd connect failed");
                    self.shared.events.error(err);
                    if let Some(max) = self.shared.max_connection_attempts {
                        if failures >= max.max(1) {
                            warn!(addr = %self.addr, attempts = failures, "giving up on nsqd");
                            self.shared.events.error(ClientError::AttemptsExhausted {
                                addr: self.addr.to_string(),
                                attempts: failures,
                            });
                            let _ = self.shared.notices.send(Notice::Gone(self.addr.to_string()));
                            break;
                        }
                    }
                }
            }

            let delay = backoff(failures);
            debug!(addr = %self.addr, ?delay, "reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(delay) => {}
            }
        }
        self.drain(&mut rx);
    }

    /// Fail whatever was queued while there was no connection to send it on.
    fn drain(&self, rx: &mut mpsc::UnboundedReceiver<Outgoing>) {
        while let Ok(out) = rx.try_recv() {
            if let Outgoing::Request(cmd, reply) = out {
                trace!(addr = %self.addr, cmd = cmd.name(), "failing queued request");
                let _ = reply.send(Err(ClientError::NotConnected(self.addr.to_string())));
            }
        }
    }

    async fn connect(&self) -> ClientResult<Transport> {
        let timeout = self.shared.options.connect_timeout;
        time::timeout(timeout, self.handshake())
            .await
            .map_err(|_| ClientError::ConnectTimeout {
                addr: self.addr.to_string(),
                timeout,
            })?
    }

    async fn handshake(&self) -> ClientResult<Transport> {
        let mut stream = TcpStream::connect(&*self.addr)
            .await
            .map_err(|e| self.io(e))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(addr = %self.addr, ?err, "failed to set TCP_NODELAY");
        }
        stream.write_all(MAGIC_V2).await.map_err(|e| self.io(e))?;
        let mut transport = Framed::new(stream, NsqCodec);

        let options = &self.shared.options;
        let identify = Identify {
            client_id: options.client_id.clone(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| options.client_id.clone()),
            user_agent: USER_AGENT.to_owned(),
            heartbeat_interval: options.heartbeat_interval.as_millis() as u64,
            feature_negotiation: false,
        };
        let body = serde_json::to_vec(&identify)
            .map_err(|e| ClientError::Protocol(format!("failed to encode IDENTIFY: {e}")))?;
        self.expect_ok(&mut transport, Command::Identify(body.into()))
            .await?;

        if let Session::Reader(cfg) = &self.shared.session {
            self.expect_ok(
                &mut transport,
                Command::Sub {
                    topic: cfg.topic.clone(),
                    channel: cfg.channel.clone(),
                },
            )
            .await?;
            let rdy = self.rdy.load(Ordering::Acquire);
            transport
                .send(Command::Rdy(rdy))
                .await
                .map_err(|e| self.io(e))?;
        }
        Ok(transport)
    }

    async fn expect_ok(&self, transport: &mut Transport, cmd: Command) -> ClientResult<()> {
        let name = cmd.name();
        transport.send(cmd).await.map_err(|e| self.io(e))?;
        loop {
            match transport.next().await {
                Some(Ok(Frame::Response(data))) if data == HEARTBEAT => {
                    transport
                        .send(Command::Nop)
                        .await
                        .map_err(|e| self.io(e))?;
                }
                Some(Ok(Frame::Response(data))) if data == OK => return Ok(()),
                Some(Ok(Frame::Response(data))) => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected response to {name}: {}",
                        String::from_utf8_lossy(&data)
                    )));
                }
                Some(Ok(Frame::Error(data))) => {
                    return Err(ClientError::Broker(
                        String::from_utf8_lossy(&data).into_owned(),
                    ));
                }
                Some(Ok(Frame::Message(_))) => {
                    return Err(ClientError::Protocol(format!(
                        "message received before {name} completed"
                    )));
                }
                Some(Err(err)) => return Err(self.io(err)),
                None => {
                    return Err(ClientError::ConnectionLost(format!(
                        "{} closed during {name}",
                        self.addr
                    )));
                }
            }
        }
    }

    /// Runs until the connection is closed on purpose (`Ok`) or lost (`Err`).
    async fn serve(
        &self,
        mut transport: Transport,
        rx: &mut mpsc::UnboundedReceiver<Outgoing>,
        responder: &Arc<ConnResponder>,
        cancel: &CancellationToken,
    ) -> ClientResult<()> {
        let mut pending = VecDeque::new();
        let res = self
            .serve_frames(&mut transport, rx, responder, cancel, &mut pending)
            .await;
        for reply in pending.drain(..) {
            let _ = reply.send(Err(ClientError::ConnectionLost(self.addr.to_string())));
        }
        res
    }

    async fn serve_frames(
        &self,
        transport: &mut Transport,
        rx: &mut mpsc::UnboundedReceiver<Outgoing>,
        responder: &Arc<ConnResponder>,
        cancel: &CancellationToken,
        pending: &mut VecDeque<oneshot::Sender<ClientResult<Bytes>>>,
    ) -> ClientResult<()> {
        let close_deadline = time::sleep(CLOSE_TIMEOUT);
        tokio::pin!(close_deadline);
        let mut closing = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !closing => {
                    if matches!(self.shared.session, Session::Writer) {
                        return Ok(());
                    }
                    debug!(addr = %self.addr, "sending CLS");
                    transport.send(Command::Cls).await.map_err(|e| self.io(e))?;
                    closing = true;
                    close_deadline.as_mut().reset(Instant::now() + CLOSE_TIMEOUT);
                }
                () = &mut close_deadline, if closing => {
                    debug!(addr = %self.addr, "no CLOSE_WAIT from nsqd, dropping connection");
                    return Ok(());
                }
                Some(out) = rx.recv() => match out {
                    Outgoing::Command(cmd) => {
                        transport.send(cmd).await.map_err(|e| self.io(e))?;
                    }
                    Outgoing::Request(cmd, reply) => match transport.send(cmd).await {
                        Ok(()) => pending.push_back(reply),
                        Err(err) => {
                            let _ = reply.send(Err(ClientError::ConnectionLost(self.addr.to_string())));
                            return Err(self.io(err));
                        }
                    },
                },
                frame = transport.next() => match frame {
                    None => {
                        return Err(ClientError::ConnectionLost(format!(
                            "{} closed the connection",
                            self.addr
                        )));
                    }
                    Some(Err(err)) => return Err(self.io(err)),
                    Some(Ok(Frame::Response(data))) if data == HEARTBEAT => {
                        trace!(addr = %self.addr, "heartbeat");
                        transport.send(Command::Nop).await.map_err(|e| self.io(e))?;
                    }
                    Some(Ok(Frame::Response(data))) if data == CLOSE_WAIT => {
                        debug!(addr = %self.addr, "nsqd acknowledged CLS");
                        return Ok(());
                    }
                    Some(Ok(Frame::Response(data))) => match pending.pop_front() {
                        Some(reply) => {
                            let _ = reply.send(Ok(data));
                        }
                        None => debug!(addr = %self.addr, "unsolicited response ignored"),
                    },
                    Some(Ok(Frame::Error(data))) => {
                        let err = ClientError::Broker(String::from_utf8_lossy(&data).into_owned());
                        if err.is_soft_broker_error() {
                            self.shared.events.error(err);
                        } else if let Some(reply) = pending.pop_front() {
                            let _ = reply.send(Err(err));
                        } else {
                            self.shared.events.error(err);
                        }
                    }
                    Some(Ok(Frame::Message(raw))) => {
                        let Session::Reader(cfg) = &self.shared.session else {
                            return Err(ClientError::Protocol(
                                "message received on a writer connection".into(),
                            ));
                        };
                        if closing {
                            // nobody will handle it now, hand it straight back
                            transport
                                .send(Command::Req { id: raw.id, timeout: Duration::ZERO })
                                .await
                                .map_err(|e| self.io(e))?;
                            continue;
                        }
                        reader::dispatch(
                            &self.shared.events,
                            cfg.max_attempts,
                            Message::new(raw, responder.clone()),
                        );
                    }
                },
            }
        }
    }
}
