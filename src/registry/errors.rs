use thiserror::Error;

use crate::marker::FingerprintPrefix;

/// Registry errors.
///
/// Idempotency conflicts (`AlreadyExists`, `AlreadyFunded`, `AlreadySent`)
/// mean the operation was a no-op, see [`RegistryError::is_conflict`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Certificate `{0}` is already registered")]
    AlreadyExists(String),

    #[error("Certificate `{0}` is already funded")]
    AlreadyFunded(String),

    #[error("Revocation transactions for `{subject}` were already sent (fund {fund_txid}, revoke {revoke_txid})")]
    AlreadySent {
        subject: String,
        fund_txid: String,
        revoke_txid: String,
    },

    #[error("Certificate `{0}` is not registered")]
    UnknownCertificate(String),

    #[error("No registered certificate has fingerprint prefix {0}")]
    UnknownFingerprint(FingerprintPrefix),

    #[error("Fingerprint prefix {prefix} of `{subject}` is already indexed for `{existing}`")]
    FingerprintCollision {
        subject: String,
        existing: String,
        prefix: FingerprintPrefix,
    },
}

impl RegistryError {
    /// Whether this is an idempotency conflict rather than a failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists(_) | Self::AlreadyFunded(_) | Self::AlreadySent { .. }
        )
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
