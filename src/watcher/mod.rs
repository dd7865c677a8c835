//! Reconciliation watchers
//!
//! Two polling loops reconcile the registry with the ledger. The pending-pool
//! watcher records the first sighting of each revocation; the confirmed-chain
//! watcher attaches the block that contains it. Each moves from `Running` to
//! `Converged` once its condition holds for every registered certificate.

mod confirmed;
mod convergence;
mod pending;

pub use confirmed::ConfirmedChainWatcher;
pub use convergence::{Convergence, WatcherKind, WatcherState};
pub use pending::PendingPoolWatcher;
