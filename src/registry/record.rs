use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BlockRef, PublicKey};
use crate::marker::{FINGERPRINT_PREFIX_LEN, FingerprintPrefix};

/// Length of a certificate fingerprint (SHA-256 digest).
pub const FINGERPRINT_LEN: usize = 32;

/// Full certificate fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub const fn new(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// The 16 byte index key.
    pub fn prefix(&self) -> FingerprintPrefix {
        let mut prefix = [0u8; FINGERPRINT_PREFIX_LEN];
        prefix.copy_from_slice(&self.0[..FINGERPRINT_PREFIX_LEN]);
        FingerprintPrefix::new(prefix)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| e.to_string())?;
        let bytes: [u8; FINGERPRINT_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("expected {FINGERPRINT_LEN} bytes, got {}", b.len()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Where a revocation was first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationSource {
    Mempool,
    Blockchain,
}

impl RevocationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mempool => "mempool",
            Self::Blockchain => "blockchain",
        }
    }
}

impl FromStr for RevocationSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "mempool" => Ok(Self::Mempool),
            "blockchain" => Ok(Self::Blockchain),
            other => Err(format!("unknown revocation type `{other}`")),
        }
    }
}

impl fmt::Display for RevocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fund/revoke transaction ids, written once together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentPair {
    pub sent_at: DateTime<Utc>,
    pub fund_txid: String,
    pub revoke_txid: String,
}

/// First observation of a revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub source: RevocationSource,
    pub observed_at: DateTime<Utc>,
    pub fee_sat: Option<u64>,
    pub funds_sat: Option<u64>,
}

/// Lifecycle state of one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// DNS name the certificate was issued for; the registry key.
    pub subject: String,
    pub generated_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    /// Key of the certificate owner's wallet address.
    pub owner_pubkey: PublicKey,
    /// Key of the issuing authority, the second multisig party.
    pub counterparty_pubkey: PublicKey,
    /// Multisig address embedded in the certificate.
    pub multisig_address: String,
    pub funded: bool,
    pub pair: Option<SentPair>,
    pub revocation: Option<Revocation>,
    /// Block that contained the revocation marker, once mined.
    pub confirmation: Option<BlockRef>,
}

impl CertificateRecord {
    pub fn new(
        subject: impl Into<String>,
        fingerprint: Fingerprint,
        owner_pubkey: PublicKey,
        counterparty_pubkey: PublicKey,
        multisig_address: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            generated_at: Utc::now(),
            fingerprint,
            owner_pubkey,
            counterparty_pubkey,
            multisig_address: multisig_address.into(),
            funded: false,
            pair: None,
            revocation: None,
            confirmation: None,
        }
    }

    pub fn with_generated_at(mut self, generated_at: DateTime<Utc>) -> Self {
        self.generated_at = generated_at;
        self
    }

    pub fn fingerprint_prefix(&self) -> FingerprintPrefix {
        self.fingerprint.prefix()
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmation.is_some()
    }

    pub fn pair_sent(&self) -> bool {
        self.pair.is_some()
    }

    pub fn revocation_source(&self) -> Option<RevocationSource> {
        self.revocation.as_ref().map(|r| r.source)
    }
}

/// Where a revocation marker was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    Mempool,
    Block(BlockRef),
}

impl Sighting {
    pub fn source(&self) -> RevocationSource {
        match self {
            Self::Mempool => RevocationSource::Mempool,
            Self::Block(_) => RevocationSource::Blockchain,
        }
    }

    pub fn block(&self) -> Option<BlockRef> {
        match self {
            Self::Mempool => None,
            Self::Block(block) => Some(*block),
        }
    }
}

/// A decoded revocation marker to apply to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub fingerprint_prefix: FingerprintPrefix,
    pub sighting: Sighting,
    pub fee_sat: Option<u64>,
    pub funds_sat: Option<u64>,
}

impl Observation {
    pub fn mempool(fingerprint_prefix: FingerprintPrefix) -> Self {
        Self {
            fingerprint_prefix,
            sighting: Sighting::Mempool,
            fee_sat: None,
            funds_sat: None,
        }
    }

    pub fn block(fingerprint_prefix: FingerprintPrefix, block: BlockRef) -> Self {
        Self {
            fingerprint_prefix,
            sighting: Sighting::Block(block),
            fee_sat: None,
            funds_sat: None,
        }
    }

    pub fn with_fee(mut self, fee_sat: Option<u64>) -> Self {
        self.fee_sat = fee_sat;
        self
    }

    pub fn with_funds(mut self, funds_sat: Option<u64>) -> Self {
        self.funds_sat = funds_sat;
        self
    }
}

/// Result of applying an [`Observation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationOutcome {
    /// First sighting, the certificate is now revoked.
    Revoked {
        subject: String,
        source: RevocationSource,
    },
    /// The certificate was already revoked; only confirmation data may have changed.
    AlreadyRevoked {
        subject: String,
        first_source: RevocationSource,
        confirmation_updated: bool,
    },
}

impl ObservationOutcome {
    pub fn subject(&self) -> &str {
        match self {
            Self::Revoked { subject, .. } | Self::AlreadyRevoked { subject, .. } => subject,
        }
    }
}
