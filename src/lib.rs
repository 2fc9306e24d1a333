//! tlshook - Non-blocking TLS session layer
//!
//! This crate provides per-connection TLS for readiness-driven servers: a
//! descriptor-indexed session table, single-step handshake progression,
//! encrypted I/O relay with partial-write handling, and post-handshake
//! certificate verification and fingerprinting.

pub mod cert;
pub mod channel;
pub mod config;
pub mod context;
pub mod event;
mod handshake;
pub mod hook;
pub mod session;

#[cfg(test)]
mod testutil;

pub use cert::{CertificateRecord, TrustState, VerifyPolicy};
pub use config::{ConfigError, TlsConfig};
pub use event::{EventMask, EventSink, ReadInterest, WriteInterest};
pub use hook::{HookError, ReadStatus, TlsHook, WriteStatus};
pub use session::{Role, SessionState};
