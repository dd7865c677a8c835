//! Fund/revoke transaction pair construction
//!
//! A revocation is two transactions. The fund transaction moves a small fixed
//! amount from the owner's wallet into the certificate's 1-of-2 multisig
//! address. The revoke transaction spends that output back to the owner, minus
//! a fixed fee, and carries the revocation marker in a null-data output.

mod builder;
mod errors;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::backend::{MultisigAddress, PublicKey};
use crate::marker::{FingerprintPrefix, Marker};
use crate::registry::CertificateRecord;

pub use builder::{TransactionPairBuilder, canonical_pubkey_order};
pub use errors::{PairError, PairResult};

/// Amounts used when building a pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PairParams {
    /// Value of the multisig output of the fund transaction.
    pub fund_amount_sat: u64,
    /// Fee left to miners by the revoke transaction.
    pub revoke_fee_sat: u64,
    pub dust_threshold_sat: u64,
    /// Fee rate of the fund transaction.
    pub fee_rate_sat_vb: u64,
}

impl Default for PairParams {
    fn default() -> Self {
        Self {
            fund_amount_sat: 477,
            revoke_fee_sat: 170,
            dust_threshold_sat: 294,
            fee_rate_sat_vb: 1,
        }
    }
}

impl PairParams {
    /// The revoke output must stay above dust after paying its fee.
    pub fn validate(&self) -> PairResult<()> {
        let floor = self
            .dust_threshold_sat
            .checked_add(self.revoke_fee_sat)
            .ok_or_else(|| PairError::InvalidParams("amounts overflow".to_string()))?;

        if self.fund_amount_sat <= floor {
            return Err(PairError::InvalidParams(format!(
                "fund amount {} sat must exceed dust threshold {} sat plus revoke fee {} sat",
                self.fund_amount_sat, self.dust_threshold_sat, self.revoke_fee_sat
            )));
        }
        if self.fee_rate_sat_vb == 0 {
            return Err(PairError::InvalidParams("fee rate must be positive".to_string()));
        }
        Ok(())
    }

    /// Value returned to the owner by the revoke transaction.
    pub fn revoke_output_sat(&self) -> u64 {
        self.fund_amount_sat.saturating_sub(self.revoke_fee_sat)
    }
}

/// Everything needed to revoke one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationRequest {
    pub subject: String,
    /// Wallet address of the owner; pays the fund transaction and receives change.
    pub owner_address: String,
    /// Key the certificate was issued to.
    pub owner_pubkey: PublicKey,
    pub counterparty_pubkey: PublicKey,
    /// Multisig address embedded in the certificate.
    pub expected_multisig: String,
    pub fingerprint_prefix: FingerprintPrefix,
    pub issued_on: NaiveDate,
    pub reason_code: u8,
}

impl RevocationRequest {
    pub fn for_record(
        record: &CertificateRecord,
        owner_address: impl Into<String>,
        reason_code: u8,
    ) -> Self {
        Self {
            subject: record.subject.clone(),
            owner_address: owner_address.into(),
            owner_pubkey: record.owner_pubkey.clone(),
            counterparty_pubkey: record.counterparty_pubkey.clone(),
            expected_multisig: record.multisig_address.clone(),
            fingerprint_prefix: record.fingerprint_prefix(),
            issued_on: record.generated_at.date_naive(),
            reason_code,
        }
    }
}

/// A signed transaction ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub txid: String,
    pub hex: String,
}

/// Signed fund and revoke transactions. Nothing has been broadcast yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionPair {
    pub fund: SignedTx,
    pub revoke: SignedTx,
    pub multisig: MultisigAddress,
    pub marker: Marker,
}
