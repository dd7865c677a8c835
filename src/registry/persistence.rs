//! CSV persistence for the revocation registry.
//!
//! One row per certificate, header first. Empty cells stand for unset
//! optional fields.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{QuoteStyle, ReaderBuilder, StringRecord, WriterBuilder};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::backend::{BlockRef, PublicKey};

use super::{
    CertificateRecord, Fingerprint, RegistryError, RegistrySnapshot, Revocation,
    RevocationRegistry, SentPair,
};

/// Column names, in file order.
pub const FIELDNAMES: [&str; 16] = [
    "Cert DNS name",
    "Cert gen timestamp",
    "Cert fingerprint",
    "CO Bitcoin pubkey",
    "CA Bitcoin pubkey",
    "Cert multisig address",
    "CO_funded",
    "TX_Pair sent timestamp",
    "Cert revocation type",
    "Cert revocation timestamp",
    "Cert revocation blockheight",
    "Cert revocation blocktime",
    "Cert revocation fees",
    "Cert revocation funds",
    "TX:Fund txid",
    "TX:Revoke txid",
];

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unexpected header, expected columns {expected:?}")]
    Header { expected: Vec<String> },

    #[error("Invalid row {row}: {message}")]
    Row { row: usize, message: String },

    #[error("Inconsistent registry file: {0}")]
    Registry(#[from] RegistryError),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Loads and stores the registry.
#[async_trait]
pub trait RegistryRepository: Send + Sync {
    /// Load the stored registry, or an empty one if nothing was stored yet.
    async fn load(&self) -> PersistenceResult<RevocationRegistry>;

    /// Replace the stored registry with `snapshot`.
    async fn save(&self, snapshot: &RegistrySnapshot) -> PersistenceResult<()>;
}

/// Registry stored as a CSV file.
#[derive(Debug, Clone)]
pub struct CsvRegistryRepository {
    path: PathBuf,
}

impl CsvRegistryRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl RegistryRepository for CsvRegistryRepository {
    async fn load(&self) -> PersistenceResult<RevocationRegistry> {
        if !fs::try_exists(&self.path).await? {
            info!(path = %self.path.display(), "No registry file found, starting empty");
            return Ok(RevocationRegistry::new());
        }

        let content = fs::read(&self.path).await?;
        let records = parse_registry_csv(&content)?;
        info!(path = %self.path.display(), certificates = records.len(), "Loaded registry");

        Ok(RevocationRegistry::from_records(records)?)
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> PersistenceResult<()> {
        let content = write_registry_csv(snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp = self.temp_path();
        fs::write(&temp, content).await?;
        fs::rename(&temp, &self.path).await?;

        info!(path = %self.path.display(), certificates = snapshot.len(), "Saved registry");
        Ok(())
    }
}

/// Serialize a snapshot, header included.
pub fn write_registry_csv(snapshot: &RegistrySnapshot) -> PersistenceResult<Vec<u8>> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::NonNumeric)
        .from_writer(Vec::new());

    writer.write_record(FIELDNAMES)?;
    for record in snapshot.iter() {
        writer.write_record(to_row(record))?;
    }

    writer
        .into_inner()
        .map_err(|e| PersistenceError::Io(e.into_error()))
}

/// Parse a registry file into records, in file order.
pub fn parse_registry_csv(content: &[u8]) -> PersistenceResult<Vec<CertificateRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(content);

    let headers = reader.headers()?;
    if headers.iter().map(str::trim).ne(FIELDNAMES) {
        return Err(PersistenceError::Header {
            expected: FIELDNAMES.iter().map(|s| s.to_string()).collect(),
        });
    }

    reader
        .records()
        .enumerate()
        .map(|(i, row)| {
            let row = row?;
            from_row(&row).map_err(|message| PersistenceError::Row { row: i + 1, message })
        })
        .collect()
}

fn to_row(record: &CertificateRecord) -> Vec<String> {
    let opt = |value: Option<String>| value.unwrap_or_default();
    let pair = record.pair.as_ref();
    let revocation = record.revocation.as_ref();
    let block = record.confirmation.as_ref();

    vec![
        record.subject.clone(),
        record.generated_at.to_rfc3339(),
        record.fingerprint.to_hex(),
        record.owner_pubkey.to_hex(),
        record.counterparty_pubkey.to_hex(),
        record.multisig_address.clone(),
        if record.funded { "True" } else { "False" }.to_string(),
        opt(pair.map(|p| p.sent_at.to_rfc3339())),
        opt(revocation.map(|r| r.source.to_string())),
        opt(revocation.map(|r| r.observed_at.to_rfc3339())),
        opt(block.map(|b| b.height.to_string())),
        opt(block.map(|b| b.time.to_rfc3339())),
        opt(revocation.and_then(|r| r.fee_sat).map(|v| v.to_string())),
        opt(revocation.and_then(|r| r.funds_sat).map(|v| v.to_string())),
        opt(pair.map(|p| p.fund_txid.clone())),
        opt(pair.map(|p| p.revoke_txid.clone())),
    ]
}

fn cell<'a>(row: &'a StringRecord, index: usize) -> Option<&'a str> {
    row.get(index).map(str::trim).filter(|s| !s.is_empty())
}

fn required<'a>(row: &'a StringRecord, index: usize) -> Result<&'a str, String> {
    cell(row, index).ok_or_else(|| format!("missing `{}`", FIELDNAMES[index]))
}

fn timestamp(value: &str, index: usize) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("`{}`: {e}", FIELDNAMES[index]))
}

fn number(value: &str, index: usize) -> Result<u64, String> {
    value
        .parse()
        .map_err(|e| format!("`{}`: {e}", FIELDNAMES[index]))
}

fn from_row(row: &StringRecord) -> Result<CertificateRecord, String> {
    if row.len() != FIELDNAMES.len() {
        return Err(format!(
            "expected {} columns, found {}",
            FIELDNAMES.len(),
            row.len()
        ));
    }

    let fingerprint: Fingerprint = required(row, 2)?
        .parse()
        .map_err(|e| format!("`{}`: {e}", FIELDNAMES[2]))?;
    let owner_pubkey: PublicKey = required(row, 3)?
        .parse()
        .map_err(|e| format!("`{}`: {e}", FIELDNAMES[3]))?;
    let counterparty_pubkey: PublicKey = required(row, 4)?
        .parse()
        .map_err(|e| format!("`{}`: {e}", FIELDNAMES[4]))?;

    let funded = match required(row, 6)?.to_ascii_lowercase().as_str() {
        "true" => true,
        "false" => false,
        other => return Err(format!("`{}`: not a boolean `{other}`", FIELDNAMES[6])),
    };

    let pair = match (cell(row, 7), cell(row, 14), cell(row, 15)) {
        (None, None, None) => None,
        (Some(sent_at), Some(fund_txid), Some(revoke_txid)) => Some(SentPair {
            sent_at: timestamp(sent_at, 7)?,
            fund_txid: fund_txid.to_string(),
            revoke_txid: revoke_txid.to_string(),
        }),
        _ => return Err("transaction pair fields must be all set or all empty".to_string()),
    };

    let revocation = match (cell(row, 8), cell(row, 9)) {
        (None, None) => None,
        (Some(source), Some(observed_at)) => Some(Revocation {
            source: source.parse()?,
            observed_at: timestamp(observed_at, 9)?,
            fee_sat: cell(row, 12).map(|v| number(v, 12)).transpose()?,
            funds_sat: cell(row, 13).map(|v| number(v, 13)).transpose()?,
        }),
        _ => return Err("revocation type and timestamp must be set together".to_string()),
    };

    let confirmation = match (cell(row, 10), cell(row, 11)) {
        (None, None) => None,
        (Some(height), Some(time)) => Some(BlockRef {
            height: number(height, 10)?,
            time: timestamp(time, 11)?,
        }),
        _ => return Err("block height and block time must be set together".to_string()),
    };

    if confirmation.is_some() && revocation.is_none() {
        return Err("confirmation block without a revocation".to_string());
    }

    Ok(CertificateRecord {
        subject: required(row, 0)?.to_string(),
        generated_at: timestamp(required(row, 1)?, 1)?,
        fingerprint,
        owner_pubkey,
        counterparty_pubkey,
        multisig_address: required(row, 5)?.to_string(),
        funded,
        pair,
        revocation,
        confirmation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FINGERPRINT_LEN, Observation, RevocationSource};

    fn record(subject: &str, byte: u8) -> CertificateRecord {
        CertificateRecord::new(
            subject,
            Fingerprint::new([byte; FINGERPRINT_LEN]),
            "02aa".parse().unwrap(),
            "03bb".parse().unwrap(),
            "2NmultisigAddress",
        )
    }

    fn header() -> String {
        FIELDNAMES
            .iter()
            .map(|f| format!("\"{f}\""))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn base_row() -> Vec<String> {
        let mut row = to_row(&record("a.example", 1));
        row[6] = "false".into();
        row
    }

    fn csv_with(row: Vec<String>) -> Vec<u8> {
        format!("{}\n{}\n", header(), row.join(",")).into_bytes()
    }

    #[tokio::test]
    async fn test_load_missing_file_gives_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let repository = CsvRegistryRepository::new(dir.path().join("registry.csv"));

        let registry = repository.load().await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_save_then_load_restores_records_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let repository = CsvRegistryRepository::new(dir.path().join("nested/registry.csv"));

        let registry = RevocationRegistry::new();
        registry.add_certificate(record("a.example", 1)).await.unwrap();
        registry.add_certificate(record("b.example", 2)).await.unwrap();
        registry.set_funded("a.example").await.unwrap();
        registry
            .record_transaction_pair_sent("a.example", "f1", "r1")
            .await
            .unwrap();
        let block = BlockRef {
            height: 100,
            time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let prefix = Fingerprint::new([1; FINGERPRINT_LEN]).prefix();
        registry
            .record_revocation_observed(&Observation::block(prefix, block).with_fee(Some(170)))
            .await
            .unwrap();

        let snapshot = registry.snapshot().await;
        repository.save(&snapshot).await.unwrap();
        assert!(!repository.temp_path().exists());

        let loaded = repository.load().await.unwrap();
        assert_eq!(loaded.snapshot().await, snapshot);
        assert_eq!(loaded.resolve(&prefix).await.as_deref(), Some("a.example"));

        let restored = loaded.snapshot().await.get("a.example").unwrap().clone();
        assert_eq!(restored.revocation_source(), Some(RevocationSource::Blockchain));
        assert_eq!(restored.revocation.unwrap().funds_sat, None);
    }

    #[tokio::test]
    async fn test_written_file_quotes_text_only() {
        let registry = RevocationRegistry::from_records([record("a.example", 1)]).unwrap();
        let snapshot = registry.snapshot().await;
        let content = String::from_utf8(write_registry_csv(&snapshot).unwrap()).unwrap();

        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), header());
        let row = lines.next().unwrap();
        assert!(row.starts_with("\"a.example\","));
        assert!(row.contains("\"False\""));
    }

    #[test]
    fn test_flag_is_case_insensitive() {
        let records = parse_registry_csv(&csv_with(base_row())).unwrap();
        assert!(!records[0].funded);

        let mut row = base_row();
        row[6] = "TRUE".into();
        assert!(parse_registry_csv(&csv_with(row)).unwrap()[0].funded);

        let mut row = base_row();
        row[6] = "yes".into();
        assert!(matches!(
            parse_registry_csv(&csv_with(row)),
            Err(PersistenceError::Row { row: 1, .. })
        ));
    }

    #[test]
    fn test_partial_groups_are_rejected() {
        let mut row = base_row();
        row[14] = "f1".into();
        assert!(matches!(
            parse_registry_csv(&csv_with(row)),
            Err(PersistenceError::Row { .. })
        ));

        let mut row = base_row();
        row[8] = "mempool".into();
        assert!(parse_registry_csv(&csv_with(row)).is_err());

        let mut row = base_row();
        row[10] = "100".into();
        assert!(parse_registry_csv(&csv_with(row)).is_err());
    }

    #[test]
    fn test_wrong_header_is_rejected() {
        let content = b"name,fingerprint\na.example,00\n";
        assert!(matches!(
            parse_registry_csv(content),
            Err(PersistenceError::Header { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_subjects_in_file_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.csv");
        let row = base_row().join(",");
        fs::write(&path, format!("{}\n{row}\n{row}\n", header()))
            .await
            .unwrap();

        let err = CsvRegistryRepository::new(&path).load().await.unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Registry(RegistryError::AlreadyExists(_))
        ));
    }
}
