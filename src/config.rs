//! Policy configuration
//!
//! The configuration loader lives outside this crate and hands us validated
//! strings; this module turns them into typed policy values and reports
//! anything malformed as a [`ConfigError`] instead of tearing the process
//! down.

use openssl::asn1::Asn1Object;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::Id;
use std::path::PathBuf;

/// Configuration errors
///
/// Surfaced synchronously from context construction or a rehash; the caller
/// logs them and keeps the previous working configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown hash type {0}")]
    UnknownHash(String),

    #[error("Unknown mode '{0}'; expected either 'chain' (default) or 'leaf'")]
    UnknownCrlMode(String),

    #[error("Expected 'key-type:key-size' in '{0}'")]
    KeyMinimumNotAPair(String),

    #[error("Expected single ':' delimiter in '{0}'")]
    KeyMinimumExtraDelimiter(String),

    #[error("Unknown key type: '{0}'")]
    UnknownKeyType(String),

    #[error("Key size must be greater than 0 (was '{0}')")]
    BadKeySize(String),

    #[error("Key type '{0}' specified multiple times")]
    DuplicateKeyType(String),

    #[error("Invalid signature algorithm '{0}'")]
    InvalidSigAlg(String),

    #[error("Unable to load CRL file '{file}' or CRL path '{path}': {source}")]
    CrlLoad {
        file: String,
        path: String,
        source: openssl::error::ErrorStack,
    },

    #[error("Couldn't open DH file {0}: {1}")]
    DhFile(PathBuf, std::io::Error),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// How far down the peer chain CRL checking reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlMode {
    /// Check the whole chain against loaded CRLs.
    Chain,
    /// Check only the leaf certificate.
    Leaf,
}

impl CrlMode {
    /// Parse the `crlmode` configuration value. Exactly two spellings are
    /// accepted; anything else aborts the rehash.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "chain" => Ok(CrlMode::Chain),
            "leaf" => Ok(CrlMode::Leaf),
            _ => Err(ConfigError::UnknownCrlMode(s.to_string())),
        }
    }
}

/// Public key algorithms accepted in the minimum-key-size list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Dsa,
    Ec,
    Ed25519,
    Ed448,
}

impl KeyKind {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" | "rsaencryption" => Ok(KeyKind::Rsa),
            "dsa" | "dsaencryption" => Ok(KeyKind::Dsa),
            "ec" | "ecdsa" | "id-ecpublickey" => Ok(KeyKind::Ec),
            "ed25519" => Ok(KeyKind::Ed25519),
            "ed448" => Ok(KeyKind::Ed448),
            _ => Err(ConfigError::UnknownKeyType(s.to_string())),
        }
    }

    /// The pkey id this kind corresponds to.
    pub fn id(&self) -> Id {
        match self {
            KeyKind::Rsa => Id::RSA,
            KeyKind::Dsa => Id::DSA,
            KeyKind::Ec => Id::EC,
            KeyKind::Ed25519 => Id::ED25519,
            KeyKind::Ed448 => Id::ED448,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            KeyKind::Rsa => "RSA",
            KeyKind::Dsa => "DSA",
            KeyKind::Ec => "EC",
            KeyKind::Ed25519 => "ED25519",
            KeyKind::Ed448 => "ED448",
        }
    }
}

/// One entry of the minimum-key-size policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMinimum {
    pub kind: KeyKind,
    pub bits: u32,
}

/// One entry of the signature-algorithm allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigAlg {
    pub nid: Nid,
    /// The configured spelling, echoed back in policy-error text.
    pub name: String,
}

/// Parse the `hash` configuration value into a fingerprint digest.
pub fn parse_digest(name: &str) -> Result<MessageDigest, ConfigError> {
    match name {
        "md5" => Ok(MessageDigest::md5()),
        "sha1" => Ok(MessageDigest::sha1()),
        "sha256" => Ok(MessageDigest::sha256()),
        _ => Err(ConfigError::UnknownHash(name.to_string())),
    }
}

/// Parse a `type:bits` comma-separated minimum-key-size list, e.g.
/// `"RSA:2048,EC:256"`. Duplicate types and malformed entries are rejected.
pub fn parse_key_minimums(spec: &str) -> Result<Vec<KeyMinimum>, ConfigError> {
    let mut minimums: Vec<KeyMinimum> = Vec::new();
    for entry in spec.split(',').filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(2, ':');
        let type_str = parts.next().unwrap_or("");
        let size_str = match parts.next() {
            Some(s) => s,
            None => return Err(ConfigError::KeyMinimumNotAPair(entry.to_string())),
        };
        if size_str.contains(':') {
            return Err(ConfigError::KeyMinimumExtraDelimiter(entry.to_string()));
        }
        let kind = KeyKind::parse(type_str)?;
        let bits: u32 = size_str
            .parse()
            .ok()
            .filter(|b| *b > 0)
            .ok_or_else(|| ConfigError::BadKeySize(size_str.to_string()))?;
        if minimums.iter().any(|m| m.kind == kind) {
            return Err(ConfigError::DuplicateKeyType(type_str.to_string()));
        }
        minimums.push(KeyMinimum { kind, bits });
    }
    Ok(minimums)
}

/// Parse a comma-separated signature-algorithm allow-list. Names are resolved
/// through the OpenSSL object table, so both long and short spellings work
/// (`sha256WithRSAEncryption`, `RSA-SHA256`).
pub fn parse_sigalgs(spec: &str) -> Result<Vec<SigAlg>, ConfigError> {
    let mut sigalgs = Vec::new();
    for name in spec.split(',').filter(|s| !s.is_empty()) {
        let obj = Asn1Object::from_str(name)
            .map_err(|_| ConfigError::InvalidSigAlg(name.to_string()))?;
        let nid = obj.nid();
        if nid == Nid::UNDEF {
            return Err(ConfigError::InvalidSigAlg(name.to_string()));
        }
        sigalgs.push(SigAlg {
            nid,
            name: name.to_string(),
        });
    }
    Ok(sigalgs)
}

/// Validated configuration strings for the TLS layer, as handed over by the
/// external configuration loader.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    pub cafile: PathBuf,
    pub crlfile: Option<PathBuf>,
    pub crlpath: Option<PathBuf>,
    /// `"chain"` or `"leaf"`.
    pub crlmode: String,
    pub ciphers: Option<String>,
    /// Fingerprint digest: `"md5"`, `"sha1"` or `"sha256"`.
    pub hash: String,
    /// `type:bits` comma-separated minimum peer key sizes.
    pub peer_keysize_min: Option<String>,
    /// Comma-separated peer signature-algorithm allow-list.
    pub peer_sigalg: Option<String>,
    pub compression: bool,
    pub renegotiation: bool,
    pub sslv3: bool,
    pub tlsv1: bool,
    pub ecdhcurve: Option<String>,
    pub dhfile: Option<PathBuf>,
    /// Upper bound for one decrypted read pass.
    pub recv_buffer_size: usize,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            certfile: PathBuf::new(),
            keyfile: PathBuf::new(),
            cafile: PathBuf::new(),
            crlfile: None,
            crlpath: None,
            crlmode: "chain".to_string(),
            ciphers: None,
            hash: "md5".to_string(),
            peer_keysize_min: None,
            peer_sigalg: None,
            compression: true,
            renegotiation: true,
            sslv3: true,
            tlsv1: true,
            ecdhcurve: Some("prime256v1".to_string()),
            dhfile: None,
            recv_buffer_size: 4096,
        }
    }
}
