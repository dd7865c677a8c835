//! Chain scanner
//!
//! Pulls transactions from the unconfirmed pool or from a range of blocks and
//! picks out the revocation markers they carry.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::backend::{BackendError, BlockRef, ChainBackend, DecodedTransaction};
use crate::marker::{self, Marker};
use crate::registry::Observation;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Invalid block range {lo}..={hi}")]
    InvalidRange { lo: u64, hi: u64 },
}

impl ScanError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_unavailable())
    }
}

pub type ScanResult<T> = Result<T, ScanError>;

/// A transaction and, once mined, the block containing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedTransaction {
    pub tx: DecodedTransaction,
    pub block: Option<BlockRef>,
}

/// A marker found in a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedMarker {
    pub txid: String,
    pub marker: Marker,
    pub block: Option<BlockRef>,
    pub fee_sat: Option<u64>,
    /// Value of the carrying transaction's spendable outputs.
    pub funds_sat: Option<u64>,
}

impl ObservedMarker {
    pub fn observation(&self) -> Observation {
        let observation = match self.block {
            Some(block) => Observation::block(self.marker.fingerprint_prefix, block),
            None => Observation::mempool(self.marker.fingerprint_prefix),
        };
        observation
            .with_fee(self.fee_sat)
            .with_funds(self.funds_sat)
    }
}

#[derive(Clone)]
pub struct ChainScanner {
    backend: Arc<dyn ChainBackend>,
}

impl ChainScanner {
    pub fn new(backend: Arc<dyn ChainBackend>) -> Self {
        Self { backend }
    }

    pub async fn chain_height(&self) -> ScanResult<u64> {
        Ok(self.backend.chain_height().await?)
    }

    /// Every transaction currently in the unconfirmed pool.
    ///
    /// Transactions that leave the pool between listing and fetching are
    /// skipped.
    pub async fn pending_transactions(&self) -> ScanResult<Vec<ScannedTransaction>> {
        let txids = self.backend.raw_mempool_txids().await?;
        let mut transactions = Vec::with_capacity(txids.len());

        for txid in txids {
            let raw = match self.backend.raw_transaction(&txid).await {
                Ok(raw) => raw,
                Err(BackendError::NotFound(_)) => {
                    trace!(%txid, "Transaction left the pool before it was fetched");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let tx = self.backend.decode_transaction(&raw).await?;
            transactions.push(ScannedTransaction { tx, block: None });
        }

        Ok(transactions)
    }

    /// Transactions of blocks `lo..=hi`, in block order then in-block order.
    pub async fn transactions_in_range(
        &self,
        lo: u64,
        hi: u64,
    ) -> ScanResult<Vec<ScannedTransaction>> {
        if lo > hi {
            return Err(ScanError::InvalidRange { lo, hi });
        }

        let mut transactions = Vec::new();
        for height in lo..=hi {
            let hash = self.backend.block_hash(height).await?;
            let block = self.backend.block_transactions(&hash).await?;
            let block_ref = BlockRef {
                height,
                time: block.time,
            };
            debug!(height, %hash, transactions = block.transactions.len(), "Scanning block");

            transactions.extend(block.transactions.into_iter().map(|tx| ScannedTransaction {
                tx,
                block: Some(block_ref),
            }));
        }

        Ok(transactions)
    }
}

/// First marker of each transaction, scanning null-data outputs in order.
///
/// Payloads that are not markers are skipped silently.
pub fn extract_markers(transactions: &[ScannedTransaction]) -> Vec<ObservedMarker> {
    transactions
        .iter()
        .filter_map(|scanned| {
            let marker = scanned
                .tx
                .outputs
                .iter()
                .filter_map(|output| output.null_data())
                .find_map(marker::decode)?;

            Some(ObservedMarker {
                txid: scanned.tx.txid.clone(),
                marker,
                block: scanned.block,
                fee_sat: scanned.tx.fee_sat,
                funds_sat: Some(scanned.tx.spendable_value_sat()),
            })
        })
        .collect()
}
