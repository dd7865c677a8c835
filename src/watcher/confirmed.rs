use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::registry::{Observation, RevocationRegistry};
use crate::scanner::{ChainScanner, ScanResult, extract_markers};

use super::{Convergence, WatcherKind};

/// Follows the chain tip until every certificate has a confirmation block.
///
/// Heights up to and including `last_scanned_height` are never scanned again.
/// With no height scanned yet, scanning starts at the genesis block.
pub struct ConfirmedChainWatcher {
    scanner: ChainScanner,
    registry: RevocationRegistry,
    convergence: Convergence,
    interval: Duration,
    last_scanned_height: Option<u64>,
}

impl ConfirmedChainWatcher {
    pub fn new(
        scanner: ChainScanner,
        registry: RevocationRegistry,
        convergence: Convergence,
        interval: Duration,
        last_scanned_height: Option<u64>,
    ) -> Self {
        Self {
            scanner,
            registry,
            convergence,
            interval,
            last_scanned_height,
        }
    }

    /// Start scanning at `start_height`, or after the current tip when unset.
    pub async fn starting_at(
        scanner: ChainScanner,
        registry: RevocationRegistry,
        convergence: Convergence,
        interval: Duration,
        start_height: Option<u64>,
    ) -> ScanResult<Self> {
        let last_scanned_height = match start_height {
            Some(height) => height.checked_sub(1),
            None => Some(scanner.chain_height().await?),
        };
        debug!(?last_scanned_height, "Confirmed-chain watcher ready");

        Ok(Self::new(
            scanner,
            registry,
            convergence,
            interval,
            last_scanned_height,
        ))
    }

    pub fn last_scanned_height(&self) -> Option<u64> {
        self.last_scanned_height
    }

    /// Scan blocks mined since the last successful scan. Returns whether every
    /// certificate is confirmed.
    pub async fn poll_once(&mut self) -> ScanResult<bool> {
        let current = self.scanner.chain_height().await?;
        let lo = match self.last_scanned_height {
            Some(last) if current <= last => return Ok(self.registry.all_confirmed().await),
            Some(last) => last + 1,
            None => 0,
        };

        let transactions = self.scanner.transactions_in_range(lo, current).await?;
        let observations: Vec<Observation> = extract_markers(&transactions)
            .iter()
            .map(|m| m.observation())
            .collect();

        let batch = self.registry.record_observations(&observations).await;
        self.last_scanned_height = Some(current);
        debug!(
            from = lo,
            to = current,
            markers = observations.len(),
            "Scanned blocks"
        );

        Ok(batch.all_confirmed)
    }

    pub async fn run(mut self) {
        let kind = WatcherKind::ConfirmedChain;
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
                    info!(
                        watcher = %kind,
                        height = ?self.last_scanned_height,
                        "Every revocation is confirmed, watcher converged"
                    );
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

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
