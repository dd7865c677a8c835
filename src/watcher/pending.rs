use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::registry::{Observation, RevocationRegistry};
use crate::scanner::{ChainScanner, ScanResult, extract_markers};

use super::{Convergence, WatcherKind};

/// Polls the unconfirmed pool until every certificate has a revocation type.
pub struct PendingPoolWatcher {
    scanner: ChainScanner,
    registry: RevocationRegistry,
    convergence: Convergence,
    interval: Duration,
}

impl PendingPoolWatcher {
    pub fn new(
        scanner: ChainScanner,
        registry: RevocationRegistry,
        convergence: Convergence,
        interval: Duration,
    ) -> Self {
        Self {
            scanner,
            registry,
            convergence,
            interval,
        }
    }

    /// One scan of the pool. Returns whether every certificate is revoked.
    pub async fn poll_once(&self) -> ScanResult<bool> {
        let transactions = self.scanner.pending_transactions().await?;
        let observations: Vec<Observation> = extract_markers(&transactions)
            .iter()
            .map(|m| m.observation())
            .collect();
        debug!(
            transactions = transactions.len(),
            markers = observations.len(),
            "Scanned pending pool"
        );

        let batch = self.registry.record_observations(&observations).await;
        Ok(batch.all_revoked)
    }

    pub async fn run(self) {
        let kind = WatcherKind::PendingPool;
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.convergence.should_stop(kind) {
                break;
            }

            match self.poll_once().await {
                Ok(true) => {
                    self.convergence.mark_converged(kind);
                    info!(watcher = %kind, "Every certificate has a revocation, watcher converged");
                    break;
                }
                Ok(false) => {}
                Err(e) if e.is_unavailable() => {
                    warn!(watcher = %kind, "Node unavailable, retrying on next poll: {e}")
                }
                Err(e) => warn!(watcher = %kind, "Scan failed, retrying on next poll: {e}"),
            }
        }
    }

    /// Run the loop as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
