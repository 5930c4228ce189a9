//! Readiness barrier: releases once every enabled sub-client has reported
//! ready, in whatever order the reports arrive.
//!
//! The barrier itself is owned by the single task that consumes sub-client
//! events. Observers hold a [`ReadySignal`], and shutdown holds an
//! [`Abandon`] handle that ends a wait which can no longer succeed.
use std::{collections::HashSet, sync::Arc};

use nsq_client::Role;
use tokio::sync::watch;

use crate::error::{CoordinationError, CoordinationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Pending { remaining: usize },
    /// terminal
    Satisfied,
    /// shutdown came first; terminal
    Abandoned,
}

/// Outcome of a single ready report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Waiting { remaining: usize },
    /// returned exactly once per barrier
    Satisfied,
    /// duplicate report, unknown role, or the barrier is already terminal
    Ignored,
}

#[derive(Debug)]
pub struct ReadinessBarrier {
    pending: HashSet<Role>,
    state: Arc<watch::Sender<BarrierState>>,
}

impl ReadinessBarrier {
    /// A barrier waiting on each role in `roles` once. With no roles it is
    /// satisfied from the start.
    pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
        let pending = roles.into_iter().collect::<HashSet<_>>();
        let initial = if pending.is_empty() {
            BarrierState::Satisfied
        } else {
            BarrierState::Pending {
                remaining: pending.len(),
            }
        };
        Self {
            pending,
            state: Arc::new(watch::Sender::new(initial)),
        }
    }

    /// Record that `role` is ready.
    pub fn arrive(&mut self, role: Role) -> Transition {
        if !self.pending.remove(&role) {
            return Transition::Ignored;
        }
        let remaining = self.pending.len();
        let mut transition = Transition::Ignored;
        self.state.send_if_modified(|state| match state {
            BarrierState::Pending { .. } if remaining == 0 => {
                *state = BarrierState::Satisfied;
                transition = Transition::Satisfied;
                true
            }
            BarrierState::Pending { remaining: left } => {
                *left = remaining;
                transition = Transition::Waiting { remaining };
                true
            }
            BarrierState::Satisfied | BarrierState::Abandoned => false,
        });
        transition
    }

    pub fn state(&self) -> BarrierState {
        *self.state.borrow()
    }

    pub fn signal(&self) -> ReadySignal {
        ReadySignal {
            rx: self.state.subscribe(),
        }
    }

    pub fn abandon_handle(&self) -> Abandon {
        Abandon {
            state: self.state.clone(),
        }
    }
}

/// Waits for the barrier to release.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    rx: watch::Receiver<BarrierState>,
}

impl ReadySignal {
    pub fn state(&self) -> BarrierState {
        *self.rx.borrow()
    }

    pub fn is_satisfied(&self) -> bool {
        self.state() == BarrierState::Satisfied
    }

    /// Resolves when the barrier is satisfied, or fails with `ShutDown` if it
    /// was abandoned first.
    pub async fn wait(&mut self) -> CoordinationResult<()> {
        let state = *self
            .rx
            .wait_for(|state| !matches!(state, BarrierState::Pending { .. }))
            .await
            .map_err(|_| CoordinationError::ShutDown)?;
        match state {
            BarrierState::Satisfied => Ok(()),
            _ => Err(CoordinationError::ShutDown),
        }
    }
}

/// Gives up a pending barrier.
#[derive(Debug, Clone)]
pub struct Abandon {
    state: Arc<watch::Sender<BarrierState>>,
}

impl Abandon {
    /// Returns false if the barrier had already finished.
    pub fn abandon(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            BarrierState::Pending { .. } => {
                *state = BarrierState::Abandoned;
                true
            }
            BarrierState::Satisfied | BarrierState::Abandoned => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn both() -> ReadinessBarrier {
        ReadinessBarrier::new([Role::Writer, Role::Reader])
    }

    #[test]
    fn test_writer_then_reader() {
        let mut barrier = both();
        assert_eq!(barrier.state(), BarrierState::Pending { remaining: 2 });
        assert_eq!(
            barrier.arrive(Role::Writer),
            Transition::Waiting { remaining: 1 }
        );
        assert_eq!(barrier.arrive(Role::Reader), Transition::Satisfied);
        assert_eq!(barrier.state(), BarrierState::Satisfied);
    }

    #[test]
    fn test_reader_then_writer() {
        let mut barrier = both();
        assert_eq!(
            barrier.arrive(Role::Reader),
            Transition::Waiting { remaining: 1 }
        );
        assert_eq!(barrier.arrive(Role::Writer), Transition::Satisfied);
        assert_eq!(barrier.state(), BarrierState::Satisfied);
    }

    #[test]
    fn test_duplicates_never_release_twice() {
        let mut barrier = both();
        let transitions = [
            Role::Writer,
            Role::Writer,
            Role::Reader,
            Role::Reader,
            Role::Writer,
        ]
        .into_iter()
        .map(|role| barrier.arrive(role))
        .collect::<Vec<_>>();
        assert_eq!(
            transitions,
            vec![
                Transition::Waiting { remaining: 1 },
                Transition::Ignored,
                Transition::Satisfied,
                Transition::Ignored,
                Transition::Ignored,
            ]
        );
        assert_eq!(
            transitions
                .iter()
                .filter(|t| **t == Transition::Satisfied)
                .count(),
            1
        );
    }

    #[test]
    fn test_unknown_role_ignored() {
        let mut barrier = ReadinessBarrier::new([Role::Writer]);
        assert_eq!(barrier.arrive(Role::Reader), Transition::Ignored);
        assert_eq!(barrier.state(), BarrierState::Pending { remaining: 1 });
        assert_eq!(barrier.arrive(Role::Writer), Transition::Satisfied);
    }

    #[test]
    fn test_no_roles_is_satisfied() {
        let barrier = ReadinessBarrier::new([]);
        assert!(barrier.signal().is_satisfied());
    }

    #[tokio::test]
    async fn test_signal_resolves_on_release() {
        let mut barrier = both();
        let mut signal = barrier.signal();
        let waiter = tokio::spawn(async move { signal.wait().await });

        barrier.arrive(Role::Reader);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        barrier.arrive(Role::Writer);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_abandon_supersedes_wait() {
        let mut barrier = both();
        let mut signal = barrier.signal();
        let abandon = barrier.abandon_handle();
        barrier.arrive(Role::Writer);

        assert!(abandon.abandon());
        assert!(!abandon.abandon());
        assert!(matches!(
            signal.wait().await,
            Err(CoordinationError::ShutDown)
        ));
        // late ready after shutdown changes nothing
        assert_eq!(barrier.arrive(Role::Reader), Transition::Ignored);
        assert_eq!(barrier.state(), BarrierState::Abandoned);
    }

    #[tokio::test]
    async fn test_abandon_after_release_is_noop() {
        let mut barrier = ReadinessBarrier::new([Role::Writer]);
        let mut signal = barrier.signal();
        barrier.arrive(Role::Writer);
        assert!(!barrier.abandon_handle().abandon());
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_barrier_fails_wait() {
        let barrier = both();
        let mut signal = barrier.signal();
        drop(barrier);
        assert!(signal.wait().await.is_err());
    }
}
