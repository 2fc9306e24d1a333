//! Shared helpers for unit tests: in-process key and certificate generation.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn rsa_key(bits: u32) -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(bits).unwrap()).unwrap()
}

fn build_cert(
    cn: &str,
    key: &PKey<Private>,
    not_before: &Asn1Time,
    not_after: &Asn1Time,
) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(not_before).unwrap();
    builder.set_not_after(not_after).unwrap();

    let mut serial = BigNum::new().unwrap();
    serial.rand(127, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();

    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// A currently valid self-signed certificate, sha256WithRSAEncryption.
pub(crate) fn self_signed_cert(cn: &str, key: &PKey<Private>) -> X509 {
    let not_before = Asn1Time::days_from_now(0).unwrap();
    let not_after = Asn1Time::days_from_now(365).unwrap();
    build_cert(cn, key, &not_before, &not_after)
}

/// A certificate whose validity window ended in the past.
pub(crate) fn expired_cert(cn: &str, key: &PKey<Private>) -> X509 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let not_before = Asn1Time::from_unix(now - 200_000).unwrap();
    let not_after = Asn1Time::from_unix(now - 100_000).unwrap();
    build_cert(cn, key, &not_before, &not_after)
}
