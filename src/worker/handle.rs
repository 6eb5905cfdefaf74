use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Outcome;

/// Where the consume loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    WaitingForMessage,
    Processing,
    Stopped,
}

/// Settlement counters since the worker started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub stored: u64,
    pub retried: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
}

pub(super) struct Shared {
    state: watch::Sender<WorkerState>,
    stored: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Shared {
    pub(super) fn new() -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            state,
            stored: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    pub(super) fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    pub(super) fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Stored(_) => &self.stored,
            Outcome::Retried => &self.retried,
            Outcome::Dropped => &self.dropped,
            Outcome::DeadLettered => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            stored: self.stored.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Handle to control and join the background relay worker.
///
/// Dropping the handle also stops the worker, since the loop treats a closed
/// shutdown channel as a shutdown request.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl WorkerHandle {
    pub(super) fn new(shutdown: watch::Sender<bool>, join: JoinHandle<()>, shared: Arc<Shared>) -> Self {
        Self { shutdown, join, shared }
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait until the worker reaches `state`, up to `timeout`.
    pub async fn wait_for_state(&self, state: WorkerState, timeout: Duration) -> bool {
        let mut rx = self.shared.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// Returns the state the worker finished in.
    pub async fn shutdown(self) -> WorkerState {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Relay worker task failed");
        }

        let state = *self.shared.state.borrow();
        tracing::info!(?state, stats = ?self.shared.stats(), "Relay worker stopped");
        state
    }
}
