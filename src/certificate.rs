//! BlockVoke certificates
//!
//! A BlockVoke certificate is an ordinary X.509 certificate carrying two
//! private extensions: the 1-of-2 multisig address that anchors its revocation
//! (`1.2.3.4`) and the issuing authority's public key (`1.2.3.5`), both as
//! text.

use std::path::Path;

use chrono::{DateTime, Utc};
use ring::digest;
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::backend::PublicKey;
use crate::registry::{CertificateRecord, FINGERPRINT_LEN, Fingerprint};

/// Extension holding the multisig address.
pub const MULTISIG_ADDRESS_OID: &str = "1.2.3.4";
/// Extension holding the authority's public key, hex encoded.
pub const COUNTERPARTY_PUBKEY_OID: &str = "1.2.3.5";

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PEM decoding failed: {0}")]
    Pem(String),

    #[error("Certificate parsing failed: {0}")]
    Parse(String),

    #[error("Certificate contains unparsed data after DER")]
    TrailingData,

    #[error("Certificate has neither a DNS name nor a common name")]
    MissingSubject,

    #[error("Certificate lacks extension {0}")]
    MissingExtension(&'static str),

    #[error("Invalid value in extension {oid}: {message}")]
    InvalidExtension { oid: &'static str, message: String },

    #[error("Certificate validity is out of range")]
    InvalidValidity,
}

pub type CertificateResult<T> = Result<T, CertificateError>;

/// Fields of a BlockVoke certificate needed by the revocation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockVokeCertificate {
    pub subject: String,
    pub fingerprint: Fingerprint,
    /// Start of validity, used as the issuance date in the revocation marker.
    pub not_before: DateTime<Utc>,
    pub multisig_address: String,
    pub counterparty_pubkey: PublicKey,
    der: Vec<u8>,
}

impl BlockVokeCertificate {
    /// Parse PEM or DER input.
    pub fn parse(bytes: &[u8]) -> CertificateResult<Self> {
        if bytes.trim_ascii_start().starts_with(b"-----BEGIN") {
            Self::from_pem(bytes)
        } else {
            Self::from_der(bytes)
        }
    }

    pub fn from_pem(pem: &[u8]) -> CertificateResult<Self> {
        let (_, pem) = parse_x509_pem(pem.trim_ascii_start())
            .map_err(|e| CertificateError::Pem(e.to_string()))?;
        Self::from_der(&pem.contents)
    }

    pub fn from_der(der: &[u8]) -> CertificateResult<Self> {
        let (rem, cert) =
            X509Certificate::from_der(der).map_err(|e| CertificateError::Parse(e.to_string()))?;
        if !rem.is_empty() {
            return Err(CertificateError::TrailingData);
        }

        let subject = subject_name(&cert).ok_or(CertificateError::MissingSubject)?;

        let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or(CertificateError::InvalidValidity)?;

        let multisig_address = extension_text(&cert, MULTISIG_ADDRESS_OID)?;
        let counterparty_pubkey = extension_text(&cert, COUNTERPARTY_PUBKEY_OID)?
            .parse()
            .map_err(|e: hex::FromHexError| CertificateError::InvalidExtension {
                oid: COUNTERPARTY_PUBKEY_OID,
                message: e.to_string(),
            })?;

        Ok(Self {
            subject,
            fingerprint: sha256_fingerprint(der),
            not_before,
            multisig_address,
            counterparty_pubkey,
            der: der.to_vec(),
        })
    }

    /// Read a certificate file.
    pub async fn load<P: AsRef<Path>>(path: P) -> CertificateResult<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Self::parse(&bytes)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

impl CertificateRecord {
    /// Fresh registry record for a certificate whose owner holds `owner_pubkey`.
    pub fn from_certificate(cert: &BlockVokeCertificate, owner_pubkey: PublicKey) -> Self {
        CertificateRecord::new(
            cert.subject.clone(),
            cert.fingerprint,
            owner_pubkey,
            cert.counterparty_pubkey.clone(),
            cert.multisig_address.clone(),
        )
        .with_generated_at(cert.not_before)
    }
}

/// SHA-256 over the DER encoding.
pub fn sha256_fingerprint(der: &[u8]) -> Fingerprint {
    let digest = digest::digest(&digest::SHA256, der);
    let mut bytes = [0u8; FINGERPRINT_LEN];
    bytes.copy_from_slice(digest.as_ref());
    Fingerprint::new(bytes)
}

fn subject_name(cert: &X509Certificate<'_>) -> Option<String> {
    let dns_name = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .and_then(|san| {
            san.value.general_names.iter().find_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
        });

    dns_name.or_else(|| {
        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(String::from)
    })
}

fn extension_text(cert: &X509Certificate<'_>, oid: &'static str) -> CertificateResult<String> {
    let extension = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == oid)
        .ok_or(CertificateError::MissingExtension(oid))?;

    let text = std::str::from_utf8(unwrap_der_string(extension.value)).map_err(|e| {
        CertificateError::InvalidExtension {
            oid,
            message: e.to_string(),
        }
    })?;

    let text = text.trim();
    if text.is_empty() {
        return Err(CertificateError::InvalidExtension {
            oid,
            message: "empty value".to_string(),
        });
    }
    Ok(text.to_string())
}

/// Contents of a short DER string (UTF8String, PrintableString, IA5String or
/// OCTET STRING); anything else is returned as is.
fn unwrap_der_string(value: &[u8]) -> &[u8] {
    const STRING_TAGS: [u8; 4] = [0x04, 0x0c, 0x13, 0x16];

    match value {
        [tag, len, rest @ ..]
            if STRING_TAGS.contains(tag) && *len < 0x80 && rest.len() == *len as usize =>
        {
            rest
        }
        _ => value,
    }
}
