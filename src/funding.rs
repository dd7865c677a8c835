//! Owner funding
//!
//! Before a certificate can be revoked its owner address needs coins to pay
//! for the fund transaction. A faucet wallet pays every unfunded owner a fixed
//! amount, batching many owners into one transaction.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{
    BackendError, ChainBackend, OutputSpec, first_address_by_label, inputs_from_address,
};
use crate::registry::{RegistryError, RevocationRegistry};

#[derive(Error, Debug)]
pub enum FundingError {
    #[error("Invalid funding configuration: {0}")]
    InvalidConfig(String),

    #[error("Faucet address unavailable: {0}")]
    Faucet(#[source] BackendError),
}

pub type FundingResult<T> = Result<T, FundingError>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FundingConfig {
    /// Run funding before sending revocations.
    pub enabled: bool,
    /// Label of the faucet's address, which also receives change.
    pub faucet_label: String,
    pub amount_sat: u64,
    /// Most owners paid by a single transaction.
    pub batch_size: usize,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            faucet_label: "faucet".to_string(),
            amount_sat: 600,
            batch_size: 100,
        }
    }
}

/// Outcome of a funding run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FundingReport {
    /// Txids of the broadcast batches.
    pub txids: Vec<String>,
    /// Subjects marked funded by this run.
    pub funded: Vec<String>,
    /// Subjects left unfunded, with the reason.
    pub failed: Vec<(String, String)>,
    /// Subjects that were already funded.
    pub skipped: usize,
}

/// Pay every unfunded owner from the faucet.
///
/// Batches spend coins of the faucet address only. Owners whose address cannot be resolved, or whose batch fails, stay
/// unfunded and are listed in the report.
pub async fn fund_owners(
    backend: Arc<dyn ChainBackend>,
    registry: &RevocationRegistry,
    config: &FundingConfig,
    owner_label_suffix: &str,
    fee_rate_sat_vb: u64,
) -> FundingResult<FundingReport> {
    if config.batch_size == 0 {
        return Err(FundingError::InvalidConfig(
            "batch size must be positive".to_string(),
        ));
    }

    let mut report = FundingReport::default();
    let mut due = Vec::new();

    for record in registry.snapshot().await.iter() {
        if record.funded {
            report.skipped += 1;
            continue;
        }

        let label = format!("{}{owner_label_suffix}", record.subject);
        match first_address_by_label(backend.as_ref(), &label).await {
            Ok(address) => due.push((record.subject.clone(), address)),
            Err(e) => {
                warn!(subject = %record.subject, "Cannot resolve owner address: {e}");
                report.failed.push((record.subject.clone(), e.to_string()));
            }
        }
    }

    if due.is_empty() {
        info!(skipped = report.skipped, "No owner needs funding");
        return Ok(report);
    }

    let faucet = first_address_by_label(backend.as_ref(), &config.faucet_label)
        .await
        .map_err(FundingError::Faucet)?;

    for batch in due.chunks(config.batch_size) {
        let outputs: Vec<OutputSpec> = batch
            .iter()
            .map(|(_, address)| OutputSpec::Address {
                address: address.clone(),
                amount_sat: config.amount_sat,
            })
            .collect();

        let total_sat = config.amount_sat.saturating_mul(batch.len() as u64);
        match send_batch(backend.as_ref(), &outputs, total_sat, &faucet, fee_rate_sat_vb).await {
            Ok(txid) => {
                info!(%txid, owners = batch.len(), "Funding batch sent");
                report.txids.push(txid);
                for (subject, _) in batch {
                    match registry.set_funded(subject).await {
                        Ok(()) | Err(RegistryError::AlreadyFunded(_)) => {
                            report.funded.push(subject.clone())
                        }
                        Err(e) => report.failed.push((subject.clone(), e.to_string())),
                    }
                }
            }
            Err(e) => {
                warn!(owners = batch.len(), "Funding batch failed: {e}");
                report.failed.extend(
                    batch
                        .iter()
                        .map(|(subject, _)| (subject.clone(), e.to_string())),
                );
            }
        }
    }

    info!(
        funded = report.funded.len(),
        failed = report.failed.len(),
        skipped = report.skipped,
        "Funding complete"
    );
    Ok(report)
}

async fn send_batch(
    backend: &dyn ChainBackend,
    outputs: &[OutputSpec],
    total_sat: u64,
    faucet: &str,
    fee_rate_sat_vb: u64,
) -> Result<String, BackendError> {
    let inputs =
        inputs_from_address(backend, faucet, total_sat, outputs.len(), fee_rate_sat_vb).await?;
    let raw = backend.create_transaction(&inputs, outputs).await?;
    let funded = backend.fund_transaction(&raw, faucet, fee_rate_sat_vb).await?;
    let signed = backend
        .sign_transaction(&funded.hex, &[faucet.to_string()], &[])
        .await?;
    if !signed.complete {
        return Err(BackendError::Signing(
            "faucet signature incomplete".to_string(),
        ));
    }
    backend.broadcast_transaction(&signed.hex).await
}
