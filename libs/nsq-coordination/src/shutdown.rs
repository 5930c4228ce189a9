//! Host pre-stop hook: closes the reader, then the writer.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use nsq_client::{Role, SubClient};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    barrier::Abandon,
    diagnostics::SUBSYSTEM,
    metrics,
    system::{ClientState, ClientStates},
};

/// Clonable handle that shuts the system down. Safe to call at any point,
/// including before readiness, and any number of times.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    writer: Arc<dyn SubClient>,
    reader: Option<Arc<dyn SubClient>>,
    done: AtomicBool,
    barrier: Abandon,
    states: Arc<Mutex<ClientStates>>,
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub(crate) fn new(
        writer: Arc<dyn SubClient>,
        reader: Option<Arc<dyn SubClient>>,
        barrier: Abandon,
        states: Arc<Mutex<ClientStates>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer,
                reader,
                done: AtomicBool::new(false),
                barrier,
                states,
                token,
            }),
        }
    }

    /// Close every sub-client, reader first. Close is fire-and-forget, so
    /// this returns right away. Returns false if shutdown had already run.
    pub fn shutdown(&self) -> bool {
        if self.inner.done.swap(true, Ordering::AcqRel) {
            debug!(subsystem = SUBSYSTEM, "shutdown already requested");
            return false;
        }
        let abandoned = self.inner.barrier.abandon();
        info!(
            subsystem = SUBSYSTEM,
            before_ready = abandoned,
            "shutting down nsq sub-clients"
        );

        if let Some(reader) = &self.inner.reader {
            reader.close();
        }
        self.inner.writer.close();

        {
            let mut states = self.inner.states.lock();
            states.set(Role::Writer, ClientState::Closed);
            states.set(Role::Reader, ClientState::Closed);
        }
        self.inner.token.cancel();
        if !abandoned {
            // the barrier had released, so this system was counted as ready
            metrics::SYSTEM_READY.dec();
        }
        metrics::SHUTDOWNS.inc();
        true
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        self.inner.token.cancelled().await
    }
}
