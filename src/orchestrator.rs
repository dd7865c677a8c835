//! Revocation run
//!
//! Starts both watchers, sends the revocation pair of every funded certificate
//! that has none yet, then waits for the watchers to converge and persists the
//! registry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, ChainBackend, first_address_by_label};
use crate::registry::{
    CertificateRecord, PersistenceError, RegistryError, RegistryRepository, RegistrySnapshot,
    RevocationRegistry,
};
use crate::scanner::{ChainScanner, ScanError};
use crate::transaction::{PairError, RevocationRequest, TransactionPairBuilder};
use crate::watcher::{ConfirmedChainWatcher, Convergence, PendingPoolWatcher};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Transaction pair error: {0}")]
    Pair(#[from] PairError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Fund transaction {fund_txid} of {subject} was broadcast, its revoke transaction was not: {source}")]
    RevokeNotBroadcast {
        subject: String,
        fund_txid: String,
        #[source]
        source: BackendError,
    },
}

impl OrchestratorError {
    /// The node could not be reached.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Backend(e) | Self::RevokeNotBroadcast { source: e, .. } => e.is_unavailable(),
            Self::Pair(e) => e.is_unavailable(),
            Self::Scan(e) => e.is_unavailable(),
            Self::Registry(_) | Self::Persistence(_) => false,
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub reason_code: u8,
    /// Appended to a subject to find the label of its owner address.
    pub owner_label_suffix: String,
    pub mempool_interval: Duration,
    pub chain_interval: Duration,
    /// How often the orchestrator checks whether both watchers converged.
    pub convergence_check: Duration,
    /// First block the confirmed-chain watcher scans. Defaults to the block
    /// after the current tip.
    pub start_height: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reason_code: 0,
            owner_label_suffix: "-coaddress".to_string(),
            mempool_interval: Duration::from_secs(1),
            chain_interval: Duration::from_secs(5),
            convergence_check: Duration::from_millis(500),
            start_height: None,
        }
    }
}

/// A fund transaction whose revoke transaction never made it out. Its
/// multisig output holds the owner's coins until spent by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedFund {
    pub subject: String,
    pub fund_txid: String,
}

/// Counts from one pass over the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub sent: usize,
    /// Already sent, or not funded yet.
    pub skipped: usize,
    pub failed: usize,
    /// Failures because the node was unreachable, included in `failed`.
    pub unreachable: usize,
    pub orphaned: Vec<OrphanedFund>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorReport {
    pub pairs_sent: usize,
    pub pairs_skipped: usize,
    pub pairs_failed: usize,
    pub orphaned_funds: Vec<OrphanedFund>,
    /// The run stopped on shutdown before both watchers converged.
    pub interrupted: bool,
    pub snapshot: RegistrySnapshot,
}

pub struct Orchestrator {
    backend: Arc<dyn ChainBackend>,
    registry: RevocationRegistry,
    builder: TransactionPairBuilder,
    repository: Option<Arc<dyn RegistryRepository>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ChainBackend>,
        registry: RevocationRegistry,
        builder: TransactionPairBuilder,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            builder,
            repository: None,
            config,
        }
    }

    /// Persist the registry through `repository` when the run ends.
    pub fn with_repository(mut self, repository: Arc<dyn RegistryRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn registry(&self) -> &RevocationRegistry {
        &self.registry
    }

    /// Run until both watchers converge.
    pub async fn run(&self) -> OrchestratorResult<OrchestratorReport> {
        self.run_until(std::future::pending()).await
    }

    /// Run until both watchers converge or `shutdown` completes, whichever
    /// comes first. The registry is persisted in both cases.
    pub async fn run_until<F>(&self, shutdown: F) -> OrchestratorResult<OrchestratorReport>
    where
        F: Future<Output = ()>,
    {
        let convergence = Convergence::new();
        let scanner = ChainScanner::new(self.backend.clone());

        // Watchers must be running before the first send
        let confirmed = ConfirmedChainWatcher::starting_at(
            scanner.clone(),
            self.registry.clone(),
            convergence.clone(),
            self.config.chain_interval,
            self.config.start_height,
        )
        .await?;
        let pending = PendingPoolWatcher::new(
            scanner,
            self.registry.clone(),
            convergence.clone(),
            self.config.mempool_interval,
        );
        let handles = [pending.spawn(), confirmed.spawn()];

        let summary = self.send_due_pairs().await;

        tokio::pin!(shutdown);
        let mut ticker = interval(self.config.convergence_check);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let interrupted = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    warn!("Shutdown requested before the watchers converged");
                    break true;
                }
                _ = ticker.tick() => {
                    if convergence.all_converged() {
                        break false;
                    }
                }
            }
        };

        convergence.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Watcher task failed: {e}");
            }
        }

        let snapshot = self.registry.snapshot().await;
        if let Some(repository) = &self.repository {
            repository.save(&snapshot).await?;
        }

        info!(
            sent = summary.sent,
            skipped = summary.skipped,
            failed = summary.failed,
            orphaned = summary.orphaned.len(),
            revoked = snapshot.iter().filter(|r| r.is_revoked()).count(),
            confirmed = snapshot.iter().filter(|r| r.is_confirmed()).count(),
            "Revocation run finished"
        );

        Ok(OrchestratorReport {
            pairs_sent: summary.sent,
            pairs_skipped: summary.skipped,
            pairs_failed: summary.failed,
            orphaned_funds: summary.orphaned,
            interrupted,
            snapshot,
        })
    }

    /// Send the pair of every funded certificate that has none, in registry
    /// order. A failure only affects its own certificate.
    pub async fn send_due_pairs(&self) -> SendSummary {
        let mut summary = SendSummary::default();

        for record in self.registry.snapshot().await.iter() {
            if record.pair_sent() {
                debug!(subject = %record.subject, "Revocation pair already sent, skipping");
                summary.skipped += 1;
                continue;
            }
            if !record.funded {
                debug!(subject = %record.subject, "Owner not funded, skipping");
                summary.skipped += 1;
                continue;
            }

            match self.send_pair(record).await {
                Ok(()) => summary.sent += 1,
                Err(OrchestratorError::Pair(e)) if e.is_protocol_violation() => {
                    error!(subject = %record.subject, "Refusing to revoke: {e}");
                    summary.failed += 1;
                }
                Err(OrchestratorError::Registry(e)) if e.is_conflict() => {
                    summary.skipped += 1;
                }
                Err(e) => {
                    summary.failed += 1;
                    if e.is_unavailable() {
                        warn!(subject = %record.subject, "Node unavailable, pair left for the next run: {e}");
                        summary.unreachable += 1;
                    } else {
                        error!(subject = %record.subject, "Could not send revocation pair: {e}");
                    }
                    if let OrchestratorError::RevokeNotBroadcast { fund_txid, .. } = e {
                        summary.orphaned.push(OrphanedFund {
                            subject: record.subject.clone(),
                            fund_txid,
                        });
                    }
                }
            }
        }

        summary
    }

    async fn send_pair(&self, record: &CertificateRecord) -> OrchestratorResult<()> {
        let label = format!("{}{}", record.subject, self.config.owner_label_suffix);
        let owner_address = first_address_by_label(self.backend.as_ref(), &label).await?;

        let request = RevocationRequest::for_record(record, owner_address, self.config.reason_code);
        let pair = self.builder.build(&request).await?;

        let fund_txid = self.backend.broadcast_transaction(&pair.fund.hex).await?;
        let revoke_txid = match self.backend.broadcast_transaction(&pair.revoke.hex).await {
            Ok(txid) => txid,
            Err(source) => {
                error!(
                    subject = %record.subject,
                    %fund_txid,
                    multisig = %pair.multisig.address,
                    "Revoke transaction not broadcast, fund output left in the multisig address"
                );
                return Err(OrchestratorError::RevokeNotBroadcast {
                    subject: record.subject.clone(),
                    fund_txid,
                    source,
                });
            }
        };

        self.registry
            .record_transaction_pair_sent(&record.subject, &fund_txid, &revoke_txid)
            .await?;
        Ok(())
    }
}
