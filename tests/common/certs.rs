//! Test certificates minted with openssl.

use std::str::FromStr;

use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time};
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509, X509Builder, X509Extension, X509NameBuilder};

// 2021-03-01
pub const NOT_BEFORE: i64 = 1_614_556_800;

pub struct Options<'a> {
    pub common_name: &'a str,
    pub dns_name: Option<&'a str>,
    pub extensions: Vec<(&'a str, &'a [u8])>,
}

pub fn mint(options: Options<'_>) -> X509 {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", options.common_name).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(NOT_BEFORE).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();

    if let Some(dns) = options.dns_name {
        let san = SubjectAlternativeName::new()
            .dns(dns)
            .build(&builder.x509v3_context(None, None))
            .unwrap();
        builder.append_extension(san).unwrap();
    }
    for (oid, value) in options.extensions {
        let oid = Asn1Object::from_str(oid).unwrap();
        let value = Asn1OctetString::new_from_bytes(value).unwrap();
        let extension = X509Extension::new_from_der(&oid, false, &value).unwrap();
        builder.append_extension(extension).unwrap();
    }

    builder.sign(&key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// PEM of a BlockVoke certificate for `subject`.
pub fn blockvoke_pem(subject: &str, multisig: &str, counterparty_hex: &str) -> Vec<u8> {
    mint(Options {
        common_name: "Example Owner",
        dns_name: Some(subject),
        extensions: vec![
            ("1.2.3.4", multisig.as_bytes()),
            ("1.2.3.5", counterparty_hex.as_bytes()),
        ],
    })
    .to_pem()
    .unwrap()
}
