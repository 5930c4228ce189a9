//! The set of nsqd connections behind one sub-client, plus the task that
//! watches them: it reports readiness, polls nsqlookupd for new producers
//! and spreads a reader's RDY across live connections.
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    time::{self, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    ClientOptions, Endpoints, Role,
    conn::{self, ConnHandle, ConnShared, Notice, Session},
    error::ClientError,
    event::{EventStream, Events},
    lookup::LookupClient,
};

/// `interval` panics on zero, and polling faster than this is pointless
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub(crate) struct Pool {
    shared: Arc<ConnShared>,
    conns: Mutex<Vec<ConnHandle>>,
    next: AtomicUsize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// RDY each live connection gets so the total stays near `max_in_flight`
pub(crate) fn rdy_per_connection(max_in_flight: u32, live: usize) -> u32 {
    let live = u32::try_from(live.max(1)).unwrap_or(u32::MAX);
    (max_in_flight / live).max(1)
}

impl Pool {
    /// Open the pool and start its supervisor. Direct endpoints are connected
    /// to right away; lookupd endpoints are polled every `poll_interval`.
    pub(crate) fn start(
        endpoints: Endpoints,
        session: Session,
        options: Arc<ClientOptions>,
        max_connection_attempts: Option<u32>,
        poll_interval: Duration,
    ) -> (Arc<Self>, EventStream) {
        let (events, stream) = Events::channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let connect_timeout = options.connect_timeout;
        let pool = Arc::new(Self {
            shared: Arc::new(ConnShared {
                session,
                options,
                max_connection_attempts,
                events,
                notices,
            }),
            conns: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        info!(role = %pool.role(), ?endpoints, "starting sub-client");

        let lookup = match endpoints {
            Endpoints::Nsqd(addrs) => {
                for addr in addrs {
                    pool.add(addr);
                }
                None
            }
            Endpoints::Lookupd(addrs) => match LookupClient::new(addrs, connect_timeout) {
                Ok(lookup) => Some(lookup),
                Err(err) => {
                    pool.shared.events.error(err);
                    None
                }
            },
        };
        tokio::spawn(pool.clone().supervise(lookup, poll_interval, notices_rx));
        (pool, stream)
    }

    pub(crate) fn role(&self) -> Role {
        self.shared.session.role()
    }

    pub(crate) fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(role = %self.role(), "closing sub-client");
            self.cancel.cancel();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Round-robin over connections that are currently up.
    pub(crate) fn next_live(&self) -> Option<ConnHandle> {
        let conns = self.conns.lock();
        let live = conns.iter().filter(|c| c.is_live()).collect::<Vec<_>>();
        if live.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % live.len();
        Some(live[idx].clone())
    }

    /// Start a connection to `addr` unless one exists already.
    fn add(&self, addr: String) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut conns = self.conns.lock();
        if conns.iter().any(|c| c.addr() == addr) {
            return;
        }
        let rdy = match &self.shared.session {
            Session::Reader(cfg) => rdy_per_connection(cfg.max_in_flight, conns.len() + 1),
            Session::Writer => 0,
        };
        debug!(role = %self.role(), %addr, "opening nsqd connection");
        let handle = conn::spawn(
            addr,
            self.shared.clone(),
            rdy,
            &self.tracker,
            self.cancel.child_token(),
        );
        conns.push(handle);
    }

    fn remove(&self, addr: &str) -> bool {
        let mut conns = self.conns.lock();
        conns.retain(|c| c.addr() != addr);
        conns.is_empty()
    }

    fn rebalance(&self) {
        let Session::Reader(cfg) = &self.shared.session else {
            return;
        };
        let conns = self.conns.lock();
        let live = conns.iter().filter(|c| c.is_live()).count();
        if live == 0 {
            return;
        }
        let rdy = rdy_per_connection(cfg.max_in_flight, live);
        debug!(live, rdy, "redistributing RDY");
        for conn in conns.iter() {
            conn.set_rdy(rdy);
        }
    }

    async fn discover(&self, lookup: &LookupClient) {
        let found = match &self.shared.session {
            Session::Reader(cfg) => lookup.lookup(&cfg.topic).await,
            Session::Writer => lookup.nodes().await,
        };
        match found {
            Ok(addrs) => {
                debug!(role = %self.role(), producers = ?addrs, "nsqlookupd poll");
                for addr in addrs {
                    self.add(addr);
                }
            }
            Err(err) => {
                warn!(role = %self.role(), ?err, "nsqlookupd poll failed");
                self.shared.events.error(err);
            }
        }
    }

    async fn supervise(
        self: Arc<Self>,
        lookup: Option<LookupClient>,
        poll_interval: Duration,
        mut notices: mpsc::UnboundedReceiver<Notice>,
    ) {
        let mut ticker = time::interval(poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut live = 0usize;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick(), if lookup.is_some() => {
                    if let Some(lookup) = &lookup {
                        self.discover(lookup).await;
                    }
                }
                Some(notice) = notices.recv() => match notice {
                    Notice::Up(addr) => {
                        live += 1;
                        debug!(role = %self.role(), %addr, live, "connection up");
                        if live == 1 {
                            self.shared.events.ready();
                        }
                        self.rebalance();
                    }
                    Notice::Down(addr) => {
                        live = live.saturating_sub(1);
                        debug!(role = %self.role(), %addr, live, "connection down");
                        self.rebalance();
                    }
                    Notice::Gone(addr) => {
                        let none_left = self.remove(&addr);
                        // lookupd may hand the address out again later
                        if none_left && lookup.is_none() {
                            self.shared.events.error(ClientError::NotConnected(format!(
                                "every nsqd connection of the {} gave up",
                                self.role()
                            )));
                        }
                    }
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!(role = %self.role(), "sub-client closed");
        self.shared.events.closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdy_per_connection() {
        assert_eq!(rdy_per_connection(25, 1), 25);
        assert_eq!(rdy_per_connection(25, 2), 12);
        assert_eq!(rdy_per_connection(25, 0), 25);
        assert_eq!(rdy_per_connection(2, 5), 1);
        assert_eq!(rdy_per_connection(0, 1), 1);
    }
}
