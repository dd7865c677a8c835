use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The two reconciliation loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatcherKind {
    PendingPool,
    ConfirmedChain,
}

impl fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingPool => f.write_str("pending-pool"),
            Self::ConfirmedChain => f.write_str("confirmed-chain"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Running,
    Converged,
}

#[derive(Debug, Default)]
struct Inner {
    pending_converged: AtomicBool,
    confirmed_converged: AtomicBool,
    cancelled: AtomicBool,
}

/// Convergence state shared by the orchestrator and both watchers.
///
/// A watcher only ever moves itself from `Running` to `Converged`. The
/// orchestrator can cancel both loops, which then stop at the top of their
/// next iteration.
#[derive(Debug, Clone, Default)]
pub struct Convergence {
    inner: Arc<Inner>,
}

impl Convergence {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, kind: WatcherKind) -> &AtomicBool {
        match kind {
            WatcherKind::PendingPool => &self.inner.pending_converged,
            WatcherKind::ConfirmedChain => &self.inner.confirmed_converged,
        }
    }

    pub fn state(&self, kind: WatcherKind) -> WatcherState {
        if self.flag(kind).load(Ordering::Acquire) {
            WatcherState::Converged
        } else {
            WatcherState::Running
        }
    }

    pub fn mark_converged(&self, kind: WatcherKind) {
        self.flag(kind).store(true, Ordering::Release);
    }

    pub fn all_converged(&self) -> bool {
        self.state(WatcherKind::PendingPool) == WatcherState::Converged
            && self.state(WatcherKind::ConfirmedChain) == WatcherState::Converged
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Whether the loop of `kind` has nothing left to do.
    pub fn should_stop(&self, kind: WatcherKind) -> bool {
        self.is_cancelled() || self.state(kind) == WatcherState::Converged
    }
}
