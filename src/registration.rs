//! Certificate registration
//!
//! Every BlockVoke certificate found in a directory is added to the registry.
//! The owner key is the one the node's wallet holds for the address labelled
//! `<subject><owner_label_suffix>`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ChainBackend, first_address_by_label};
use crate::certificate::{BlockVokeCertificate, CertificateError};
use crate::registry::{CertificateRecord, RegistryError, RevocationRegistry};

/// File extensions read as certificates.
const CERTIFICATE_EXTENSIONS: &[&str] = &["pem", "crt", "cer", "der"];

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Cannot read certificate directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Owner lookup failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Owner address {0} has no known public key")]
    MissingOwnerKey(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

pub type RegistrationResult<T> = Result<T, RegistrationError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Subjects added by this run.
    pub added: Vec<String>,
    /// Certificates whose subject was registered before.
    pub already_registered: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Register every certificate file in `dir`, in file name order.
///
/// A file that cannot be read, parsed or matched to an owner key is reported
/// and skipped. Only an unreadable directory fails the whole run.
pub async fn register_certificates(
    backend: &dyn ChainBackend,
    registry: &RevocationRegistry,
    dir: &Path,
    owner_label_suffix: &str,
) -> RegistrationResult<RegistrationReport> {
    let mut report = RegistrationReport::default();

    for path in certificate_files(dir).await? {
        match register_one(backend, registry, &path, owner_label_suffix).await {
            Ok(subject) => {
                debug!(%subject, path = %path.display(), "Certificate registered");
                report.added.push(subject);
            }
            Err(RegistrationError::Registry(e)) if e.is_conflict() => {
                warn!(path = %path.display(), "{e}");
                report.already_registered += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), "Certificate not registered: {e}");
                report.failed.push((path, e.to_string()));
            }
        }
    }

    info!(
        added = report.added.len(),
        already_registered = report.already_registered,
        failed = report.failed.len(),
        "Certificate registration complete"
    );
    Ok(report)
}

async fn register_one(
    backend: &dyn ChainBackend,
    registry: &RevocationRegistry,
    path: &Path,
    owner_label_suffix: &str,
) -> RegistrationResult<String> {
    let cert = BlockVokeCertificate::load(path).await?;

    let label = format!("{}{owner_label_suffix}", cert.subject);
    let address = first_address_by_label(backend, &label).await?;
    let owner_pubkey = backend
        .address_info(&address)
        .await?
        .pubkey
        .ok_or(RegistrationError::MissingOwnerKey(address))?;

    registry
        .add_certificate(CertificateRecord::from_certificate(&cert, owner_pubkey))
        .await?;
    Ok(cert.subject)
}

async fn certificate_files(dir: &Path) -> RegistrationResult<Vec<PathBuf>> {
    let directory_error = |source: std::io::Error| RegistrationError::Directory {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(directory_error)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(directory_error)? {
        let path = entry.path();
        let is_certificate = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                CERTIFICATE_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });
        if is_certificate && entry.file_type().await.map_err(directory_error)?.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
