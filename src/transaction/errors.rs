use thiserror::Error;

use crate::backend::{BackendError, PublicKey};
use crate::marker::MarkerError;

/// Errors while building a fund/revoke transaction pair.
#[derive(Error, Debug)]
pub enum PairError {
    #[error("Invalid protocol parameters: {0}")]
    InvalidParams(String),

    #[error("Derived multisig address {derived} does not match certificate address {expected}")]
    ProtocolViolation { expected: String, derived: String },

    #[error("Owner address {0} has no known public key")]
    MissingOwnerKey(String),

    #[error("Owner address {address} holds key {found}, the certificate was issued to {expected}")]
    OwnerKeyMismatch {
        address: String,
        expected: PublicKey,
        found: PublicKey,
    },

    #[error("Fund transaction {txid} has no output paying the multisig address")]
    MissingFundOutput { txid: String },

    #[error("Signature of the {0} transaction is incomplete")]
    IncompleteSignature(&'static str),

    #[error("Marker error: {0}")]
    Marker(#[from] MarkerError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl PairError {
    /// A mismatch between the certificate and the keys that revoke it.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. } | Self::OwnerKeyMismatch { .. }
        )
    }

    /// The node could not be reached; the pair may succeed on a later run.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_unavailable())
    }
}

pub type PairResult<T> = Result<T, PairError>;
