//! Revocation registry
//!
//! In-memory table of certificate lifecycle records, keyed by subject name and
//! indexed by fingerprint prefix. It is the only state shared between the
//! orchestrator and the watchers.
//!
//! # Invariants
//! - every record has exactly one fingerprint index entry and vice versa
//! - index entries are never removed
//! - `funded`, the sent pair and the revocation type/timestamp are written once
//! - a blockchain sighting always updates the confirmation block

mod errors;
pub mod persistence;
mod record;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::marker::FingerprintPrefix;

pub use errors::{RegistryError, RegistryResult};
pub use persistence::{CsvRegistryRepository, PersistenceError, RegistryRepository};
pub use record::{
    CertificateRecord, FINGERPRINT_LEN, Fingerprint, Observation, ObservationOutcome, Revocation,
    RevocationSource, SentPair, Sighting,
};

#[derive(Debug, Default)]
struct RegistryState {
    certificates: IndexMap<String, CertificateRecord>,
    fingerprint_index: HashMap<FingerprintPrefix, String>,
}

impl RegistryState {
    fn add(&mut self, record: CertificateRecord) -> RegistryResult<()> {
        if self.certificates.contains_key(&record.subject) {
            return Err(RegistryError::AlreadyExists(record.subject));
        }

        let prefix = record.fingerprint_prefix();
        if let Some(existing) = self.fingerprint_index.get(&prefix) {
            return Err(RegistryError::FingerprintCollision {
                subject: record.subject,
                existing: existing.clone(),
                prefix,
            });
        }

        self.fingerprint_index.insert(prefix, record.subject.clone());
        self.certificates.insert(record.subject.clone(), record);
        Ok(())
    }

    fn observe(&mut self, observation: &Observation) -> RegistryResult<ObservationOutcome> {
        let prefix = observation.fingerprint_prefix;
        let subject = self
            .fingerprint_index
            .get(&prefix)
            .ok_or(RegistryError::UnknownFingerprint(prefix))?;
        let record = self
            .certificates
            .get_mut(subject)
            .ok_or_else(|| RegistryError::UnknownCertificate(subject.clone()))?;

        let block = observation.sighting.block();

        match &record.revocation {
            None => {
                let source = observation.sighting.source();
                record.revocation = Some(Revocation {
                    source,
                    observed_at: Utc::now(),
                    fee_sat: observation.fee_sat,
                    funds_sat: observation.funds_sat,
                });
                if block.is_some() {
                    record.confirmation = block;
                }
                Ok(ObservationOutcome::Revoked {
                    subject: record.subject.clone(),
                    source,
                })
            }
            Some(revocation) => {
                let first_source = revocation.source;
                let confirmation_updated = block.is_some();
                if confirmation_updated {
                    record.confirmation = block;
                }
                Ok(ObservationOutcome::AlreadyRevoked {
                    subject: record.subject.clone(),
                    first_source,
                    confirmation_updated,
                })
            }
        }
    }

    fn all_revoked(&self) -> bool {
        self.certificates.values().all(CertificateRecord::is_revoked)
    }

    fn all_confirmed(&self) -> bool {
        self.certificates.values().all(CertificateRecord::is_confirmed)
    }
}

fn log_observation(result: &RegistryResult<ObservationOutcome>, observation: &Observation) {
    let source = observation.sighting.source();
    match result {
        Ok(ObservationOutcome::Revoked { subject, .. }) => {
            info!(subject = %subject, %source, "Certificate revoked");
        }
        Ok(ObservationOutcome::AlreadyRevoked {
            subject,
            first_source,
            confirmation_updated,
        }) => {
            if *confirmation_updated {
                info!(subject = %subject, block = ?observation.sighting.block(), "Revocation confirmed in block");
            }
            if *first_source != source || !*confirmation_updated {
                debug!(subject = %subject, %source, %first_source, "Certificate was already revoked, keeping first sighting");
            }
        }
        Err(e) => {
            warn!(%source, "Ignoring revocation marker: {e}");
        }
    }
}

/// Outcome of applying a batch of observations under a single lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub outcomes: Vec<RegistryResult<ObservationOutcome>>,
    /// Every registered certificate has a revocation type.
    pub all_revoked: bool,
    /// Every registered certificate has a confirmation block.
    pub all_confirmed: bool,
}

/// Read-only copy of the registry, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    records: Vec<CertificateRecord>,
}

impl RegistrySnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &CertificateRecord> {
        self.records.iter()
    }

    pub fn get(&self, subject: &str) -> Option<&CertificateRecord> {
        self.records.iter().find(|r| r.subject == subject)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn all_revoked(&self) -> bool {
        self.records.iter().all(CertificateRecord::is_revoked)
    }

    pub fn all_confirmed(&self) -> bool {
        self.records.iter().all(CertificateRecord::is_confirmed)
    }

    pub fn into_records(self) -> Vec<CertificateRecord> {
        self.records
    }
}

/// Shared handle to the registry. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct RevocationRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl RevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from stored records, rebuilding the fingerprint index.
    pub fn from_records(
        records: impl IntoIterator<Item = CertificateRecord>,
    ) -> RegistryResult<Self> {
        let mut state = RegistryState::default();
        for record in records {
            state.add(record)?;
        }

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Register a certificate. `AlreadyExists` leaves the registry untouched.
    pub async fn add_certificate(&self, record: CertificateRecord) -> RegistryResult<()> {
        let subject = record.subject.clone();
        let result = self.state.lock().await.add(record);

        match &result {
            Ok(()) => info!(subject = %subject, "Certificate added to registry"),
            Err(e) => warn!("{e}, skipping"),
        }
        result
    }

    pub async fn set_funded(&self, subject: &str) -> RegistryResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .certificates
            .get_mut(subject)
            .ok_or_else(|| RegistryError::UnknownCertificate(subject.to_string()))?;

        if record.funded {
            warn!(subject, "Owner funding is already complete");
            return Err(RegistryError::AlreadyFunded(subject.to_string()));
        }

        record.funded = true;
        debug!(subject, "Owner funded");
        Ok(())
    }

    /// Record the broadcast fund/revoke pair. The first call wins.
    pub async fn record_transaction_pair_sent(
        &self,
        subject: &str,
        fund_txid: &str,
        revoke_txid: &str,
    ) -> RegistryResult<SentPair> {
        let mut state = self.state.lock().await;
        let record = state
            .certificates
            .get_mut(subject)
            .ok_or_else(|| RegistryError::UnknownCertificate(subject.to_string()))?;

        if let Some(existing) = &record.pair {
            warn!(
                subject,
                sent_at = %existing.sent_at,
                "Revocation transactions were possibly already sent, skipping"
            );
            return Err(RegistryError::AlreadySent {
                subject: subject.to_string(),
                fund_txid: existing.fund_txid.clone(),
                revoke_txid: existing.revoke_txid.clone(),
            });
        }

        let pair = SentPair {
            sent_at: Utc::now(),
            fund_txid: fund_txid.to_string(),
            revoke_txid: revoke_txid.to_string(),
        };
        record.pair = Some(pair.clone());
        info!(subject, fund_txid, revoke_txid, "Revocation transactions sent");
        Ok(pair)
    }

    /// Apply one sighting of a revocation marker.
    pub async fn record_revocation_observed(
        &self,
        observation: &Observation,
    ) -> RegistryResult<ObservationOutcome> {
        let result = self.state.lock().await.observe(observation);
        log_observation(&result, observation);
        result
    }

    /// Apply several sightings and evaluate convergence, all under one lock.
    pub async fn record_observations(&self, observations: &[Observation]) -> BatchOutcome {
        let mut state = self.state.lock().await;
        let outcomes = observations
            .iter()
            .map(|observation| {
                let result = state.observe(observation);
                log_observation(&result, observation);
                result
            })
            .collect();

        BatchOutcome {
            outcomes,
            all_revoked: state.all_revoked(),
            all_confirmed: state.all_confirmed(),
        }
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock().await;
        RegistrySnapshot {
            records: state.certificates.values().cloned().collect(),
        }
    }

    /// Subject registered under a fingerprint prefix.
    pub async fn resolve(&self, prefix: &FingerprintPrefix) -> Option<String> {
        self.state.lock().await.fingerprint_index.get(prefix).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.certificates.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all_revoked(&self) -> bool {
        self.state.lock().await.all_revoked()
    }

    pub async fn all_confirmed(&self) -> bool {
        self.state.lock().await.all_confirmed()
    }
}
