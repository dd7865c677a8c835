//! Revocation marker codec
//!
//! A marker is the fixed 31 byte payload carried by the null-data output of a
//! revoke transaction:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 9    | magic `BlockVoke`                       |
//! | 9      | 1    | version (reserved, currently `0x00`)    |
//! | 10     | 16   | fingerprint prefix                      |
//! | 26     | 4    | days since 2020-02-02, big endian       |
//! | 30     | 1    | revocation reason code                  |

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic identifier every marker starts with.
pub const MAGIC: &[u8; 9] = b"BlockVoke";

/// Version byte written by this implementation.
pub const VERSION: u8 = 0x00;

/// Length of the fingerprint prefix used as index key.
pub const FINGERPRINT_PREFIX_LEN: usize = 16;

/// Total encoded length of a marker.
pub const MARKER_LEN: usize = MAGIC.len() + 1 + FINGERPRINT_PREFIX_LEN + 4 + 1;

/// `num_days_from_ce()` of the protocol epoch, 2020-02-02.
pub(crate) const EPOCH_DAYS_FROM_CE: i32 = 737_457;

const PREFIX_OFFSET: usize = MAGIC.len() + 1;
const DAYS_OFFSET: usize = PREFIX_OFFSET + FINGERPRINT_PREFIX_LEN;
const REASON_OFFSET: usize = DAYS_OFFSET + 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MarkerError {
    #[error("Issuance date {0} lies before the protocol epoch 2020-02-02")]
    BeforeEpoch(NaiveDate),

    #[error("Invalid fingerprint prefix: {0}")]
    InvalidPrefix(String),
}

/// First 16 bytes of a certificate fingerprint.
///
/// Prefixes are a probabilistic index: two certificates may share one, so a
/// prefix is only ever resolved against certificates that are registered.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FingerprintPrefix([u8; FINGERPRINT_PREFIX_LEN]);

impl FingerprintPrefix {
    pub const fn new(bytes: [u8; FINGERPRINT_PREFIX_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_PREFIX_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for FingerprintPrefix {
    type Err = MarkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| MarkerError::InvalidPrefix(e.to_string()))?;
        let bytes: [u8; FINGERPRINT_PREFIX_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            MarkerError::InvalidPrefix(format!(
                "expected {FINGERPRINT_PREFIX_LEN} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for FingerprintPrefix {
    type Error = MarkerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FingerprintPrefix> for String {
    fn from(value: FingerprintPrefix) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for FingerprintPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FingerprintPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FingerprintPrefix({})", self.to_hex())
    }
}

/// A decoded revocation marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub version: u8,
    pub fingerprint_prefix: FingerprintPrefix,
    pub days_since_epoch: u32,
    pub reason_code: u8,
}

impl Marker {
    /// Build a marker for a certificate issued on `issued_on`.
    pub fn new(
        fingerprint_prefix: FingerprintPrefix,
        issued_on: NaiveDate,
        reason_code: u8,
    ) -> Result<Self, MarkerError> {
        let days = issued_on.num_days_from_ce() - EPOCH_DAYS_FROM_CE;
        let days_since_epoch =
            u32::try_from(days).map_err(|_| MarkerError::BeforeEpoch(issued_on))?;

        Ok(Self {
            version: VERSION,
            fingerprint_prefix,
            days_since_epoch,
            reason_code,
        })
    }

    /// Issuance date carried by the marker, if it is a representable date.
    pub fn issued_on(&self) -> Option<NaiveDate> {
        let days = i32::try_from(self.days_since_epoch).ok()?;
        NaiveDate::from_num_days_from_ce_opt(EPOCH_DAYS_FROM_CE.checked_add(days)?)
    }

    pub fn to_bytes(&self) -> [u8; MARKER_LEN] {
        let mut out = [0u8; MARKER_LEN];
        out[..MAGIC.len()].copy_from_slice(MAGIC);
        out[MAGIC.len()] = self.version;
        out[PREFIX_OFFSET..DAYS_OFFSET].copy_from_slice(self.fingerprint_prefix.as_bytes());
        out[DAYS_OFFSET..REASON_OFFSET].copy_from_slice(&self.days_since_epoch.to_be_bytes());
        out[REASON_OFFSET] = self.reason_code;
        out
    }

    /// Decode a null-data payload. Anything that is not a marker yields `None`.
    pub fn from_bytes(payload: &[u8]) -> Option<Self> {
        if payload.len() != MARKER_LEN || &payload[..MAGIC.len()] != MAGIC {
            return None;
        }

        let prefix: [u8; FINGERPRINT_PREFIX_LEN] =
            payload[PREFIX_OFFSET..DAYS_OFFSET].try_into().ok()?;
        let days: [u8; 4] = payload[DAYS_OFFSET..REASON_OFFSET].try_into().ok()?;

        Some(Self {
            version: payload[MAGIC.len()],
            fingerprint_prefix: FingerprintPrefix(prefix),
            days_since_epoch: u32::from_be_bytes(days),
            reason_code: payload[REASON_OFFSET],
        })
    }
}

/// Encode a marker payload.
pub fn encode(
    fingerprint_prefix: FingerprintPrefix,
    issued_on: NaiveDate,
    reason_code: u8,
) -> Result<[u8; MARKER_LEN], MarkerError> {
    Marker::new(fingerprint_prefix, issued_on, reason_code).map(|m| m.to_bytes())
}

/// Decode a marker payload, `None` when the payload is not a marker.
pub fn decode(payload: &[u8]) -> Option<Marker> {
    Marker::from_bytes(payload)
}
