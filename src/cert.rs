//! Certificate verification and fingerprinting
//!
//! Builds an immutable [`CertificateRecord`] for the peer's leaf certificate
//! and every chain member after a completed handshake. Policy violations
//! (key too small, disallowed signature algorithm, expired validity window)
//! are recorded as metadata on the record, not enforced here: whether a
//! connection survives a policy error is the consumer's decision.

use crate::channel::{PeerMaterial, VerifyOutcome};
use crate::config::{self, ConfigError, KeyMinimum, SigAlg, TlsConfig};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::Id;
use openssl::x509::{X509NameRef, X509Ref};
use std::cmp::Ordering;

/// Trust classification for a verified certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    /// Path validation did not flag the signer as unknown.
    Trusted,
    /// Self-signed leaf; never reported as Trusted, whatever else path
    /// validation said.
    UnknownSigner,
}

/// Everything we extract from one X.509 certificate. Immutable once built;
/// consumers hold it through an `Arc` that outlives the session.
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    /// Subject DN, oneline form. Empty if the raw DN contained CR/LF, which
    /// would otherwise leak into line-oriented output.
    pub subject: String,
    /// Issuer DN, sanitized the same way.
    pub issuer: String,
    /// Hex digest of the encoded certificate under the configured hash.
    pub fingerprint: String,
    pub not_before: String,
    pub not_after: String,
    pub trust: TrustState,
    /// Path validation reported a failure.
    pub invalid: bool,
    /// Aggregated human-readable error text; empty means no error.
    pub error: String,
}

impl Default for CertificateRecord {
    fn default() -> Self {
        CertificateRecord {
            subject: String::new(),
            issuer: String::new(),
            fingerprint: String::new(),
            not_before: String::new(),
            not_after: String::new(),
            trust: TrustState::UnknownSigner,
            invalid: true,
            error: String::new(),
        }
    }
}

impl CertificateRecord {
    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Verification policy derived from configuration.
#[derive(Clone)]
pub struct VerifyPolicy {
    pub digest: MessageDigest,
    pub key_minimums: Vec<KeyMinimum>,
    pub sigalgs: Vec<SigAlg>,
}

impl VerifyPolicy {
    pub fn from_config(config: &TlsConfig) -> Result<Self, ConfigError> {
        Ok(VerifyPolicy {
            digest: config::parse_digest(&config.hash)?,
            key_minimums: match &config.peer_keysize_min {
                Some(spec) => config::parse_key_minimums(spec)?,
                None => Vec::new(),
            },
            sigalgs: match &config.peer_sigalg {
                Some(spec) => config::parse_sigalgs(spec)?,
                None => Vec::new(),
            },
        })
    }

    /// No strength requirements, md5 fingerprints.
    pub fn permissive() -> Self {
        VerifyPolicy {
            digest: MessageDigest::md5(),
            key_minimums: Vec::new(),
            sigalgs: Vec::new(),
        }
    }
}

/// Verify the peer material captured from a finished handshake.
///
/// Returns the leaf record plus one record per chain member. An absent leaf
/// yields a lone record carrying "Could not get peer certificate" and no
/// chain walk. Chain member errors are appended to the leaf's error text,
/// annotated with their 1-based chain position, so one string aggregates
/// every failure.
pub fn verify_chain(
    material: &PeerMaterial,
    policy: &VerifyPolicy,
) -> (CertificateRecord, Vec<CertificateRecord>) {
    let leaf = match &material.leaf {
        Some(cert) => cert,
        None => {
            let mut record = CertificateRecord::default();
            record.error = "Could not get peer certificate".to_string();
            return (record, Vec::new());
        }
    };

    let mut leaf_record = verify_single(leaf, &material.verify, policy);

    // Chain members share the leaf's self-signed classification but carry
    // only their own per-certificate errors.
    let chain_outcome = VerifyOutcome {
        self_signed: material.verify.self_signed,
        error: None,
    };
    let mut chain_records = Vec::with_capacity(material.chain.len());
    for (i, cert) in material.chain.iter().enumerate() {
        let record = verify_single(cert, &chain_outcome, policy);
        if record.has_error() {
            if leaf_record.has_error() {
                leaf_record.error.push_str("\n\t");
            }
            leaf_record
                .error
                .push_str(&format!("Cert chain #{}: {}", i + 1, record.error));
        }
        chain_records.push(record);
    }

    (leaf_record, chain_records)
}

/// Verify one certificate against the policy and the path-validation
/// outcome. Later checks overwrite the error slot, so the most specific
/// failure wins.
pub fn verify_single(
    cert: &X509Ref,
    verify: &VerifyOutcome,
    policy: &VerifyPolicy,
) -> CertificateRecord {
    let mut record = CertificateRecord::default();

    record.invalid = verify.error.is_some();
    if let Some(path_error) = &verify.error {
        record.error = path_error.clone();
    }

    if let Some(strength_error) = check_strength(cert, policy) {
        record.error = strength_error;
    }

    record.trust = if verify.self_signed {
        TrustState::UnknownSigner
    } else {
        TrustState::Trusted
    };

    record.subject = sanitize_dn(name_oneline(cert.subject_name()));
    record.issuer = sanitize_dn(name_oneline(cert.issuer_name()));
    record.not_before = cert.not_before().to_string();
    record.not_after = cert.not_after().to_string();

    match cert.digest(policy.digest) {
        Ok(digest) => record.fingerprint = hex::encode(digest),
        Err(_) => record.error = "Out of memory generating fingerprint".to_string(),
    }

    match outside_validity_window(cert) {
        Ok(true) => record.error = "Not activated, or expired certificate".to_string(),
        Ok(false) => {}
        Err(_) => record.error = "Unable to parse certificate validity window".to_string(),
    }

    record
}

/// Key-size and signature-algorithm policy. The two checks are independent;
/// a size failure on a matched key type reports immediately, and an
/// unmatched type is reported separately from an undersized key.
fn check_strength(cert: &X509Ref, policy: &VerifyPolicy) -> Option<String> {
    if !policy.key_minimums.is_empty() {
        let pkey = match cert.public_key() {
            Ok(pkey) => pkey,
            Err(_) => return Some("Unable to get pubkey from peer cert".to_string()),
        };
        let kind = pkey.id();
        let bits = pkey.bits();
        match policy.key_minimums.iter().find(|m| m.kind.id() == kind) {
            Some(minimum) if bits < minimum.bits => {
                return Some(format!(
                    "'{}' key must be >= '{}' bits, was '{}'",
                    minimum.kind.label(),
                    minimum.bits,
                    bits
                ));
            }
            Some(_) => {}
            None => {
                let expected = policy
                    .key_minimums
                    .iter()
                    .map(|m| format!("{}:{}", m.kind.label(), m.bits))
                    .collect::<Vec<_>>()
                    .join(",");
                return Some(format!(
                    "Peer key type '{}' does not match expected peer key type:size pairs '{}'",
                    key_label(kind),
                    expected
                ));
            }
        }
    }

    if !policy.sigalgs.is_empty() {
        let sig_nid = cert.signature_algorithm().object().nid();
        if !policy.sigalgs.iter().any(|alg| alg.nid == sig_nid) {
            let expected = policy
                .sigalgs
                .iter()
                .map(|alg| alg.name.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let got = sig_nid.long_name().unwrap_or("unknown");
            return Some(format!(
                "Invalid signature algorithm; got '{}' expected one of '{}'",
                got, expected
            ));
        }
    }

    None
}

fn key_label(id: Id) -> String {
    match id {
        Id::RSA => "RSA".to_string(),
        Id::DSA => "DSA".to_string(),
        Id::EC => "EC".to_string(),
        Id::ED25519 => "ED25519".to_string(),
        Id::ED448 => "ED448".to_string(),
        other => format!("nid {}", other.as_raw()),
    }
}

fn outside_validity_window(cert: &X509Ref) -> Result<bool, openssl::error::ErrorStack> {
    let now = Asn1Time::days_from_now(0)?;
    Ok(cert.not_after().compare(&now)? == Ordering::Less
        || cert.not_before().compare(&now)? == Ordering::Greater)
}

/// Oneline DN rendering, `/KEY=value` pairs.
fn name_oneline(name: &X509NameRef) -> String {
    let mut out = String::new();
    for entry in name.entries() {
        let key = entry.object().nid().short_name().unwrap_or("UNDEF");
        // Render from the raw bytes: a UTF-8 conversion that stops at an
        // interior NUL would hide trailing characters from the CR/LF check.
        let value = String::from_utf8_lossy(entry.data().as_slice()).into_owned();
        out.push('/');
        out.push_str(key);
        out.push('=');
        out.push_str(&value);
    }
    out
}

/// A DN carrying line breaks could corrupt line-oriented output downstream,
/// so it is cleared entirely rather than partially escaped.
fn sanitize_dn(dn: String) -> String {
    if dn.contains(['\r', '\n']) {
        String::new()
    } else {
        dn
    }
}
