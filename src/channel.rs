//! Crypto channel abstraction
//!
//! The relay and the handshake engine talk to the record layer through the
//! [`SecureChannel`] trait, mirroring the session-operations seam used for
//! transport switching: the state machines see only the outcome enums, never
//! library return codes. [`OpenSslChannel`] is the production implementation
//! on top of an OpenSSL stream in nonblocking mode.

use crate::session::Role;
use openssl::ssl::{ErrorCode, HandshakeError, MidHandshakeSslStream, Ssl, SslStream};
use openssl::x509::{X509, X509VerifyResult};
use std::io::{Read, Write};

/// Outcome of one handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake completed; the channel is ready for record I/O.
    Done,
    /// The protocol needs more input before the next step.
    WantRead,
    /// The protocol has output to flush before the next step.
    WantWrite,
    /// Fatal protocol or setup failure.
    Failed(String),
}

/// Outcome of one encrypted read or write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoStatus {
    /// Plaintext bytes transferred.
    Bytes(usize),
    /// The peer signalled an orderly shutdown (close_notify).
    Shutdown,
    /// Retry once the transport is readable.
    WantRead,
    /// Retry once the transport is writable.
    WantWrite,
    /// The peer attempted a renegotiation the policy forbids.
    Renegotiation,
    /// Unrecoverable failure; the session must be closed.
    Fatal(String),
}

/// Structured result of the peer-chain path validation.
///
/// Replaces a mutable verification flag shared between a verify callback and
/// its consumers: the outcome is read from the finished handshake and handed
/// to the caller, so no state leaks between sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// The leaf was self-signed (self-signed-at-depth-zero).
    pub self_signed: bool,
    /// Human-readable path-validation error, if validation did not pass.
    pub error: Option<String>,
}

/// Peer identity material captured after a completed handshake.
#[derive(Default)]
pub struct PeerMaterial {
    /// The peer's own certificate, if one was presented.
    pub leaf: Option<X509>,
    /// The presented chain as the transport exposes it.
    pub chain: Vec<X509>,
    pub verify: VerifyOutcome,
}

/// One TLS connection's handshake and record interface.
pub trait SecureChannel {
    /// Drive exactly one handshake step. Never blocks and never loops; the
    /// caller re-invokes it from the next readiness callback.
    fn handshake(&mut self) -> HandshakeStatus;

    /// Decrypt available input into `buf`, one bounded pass.
    fn read(&mut self, buf: &mut [u8]) -> IoStatus;

    /// Encrypt and flush as much of `buf` as the transport accepts.
    fn write(&mut self, buf: &[u8]) -> IoStatus;

    /// Decrypted bytes already buffered inside the record layer, readable
    /// without touching the transport.
    fn pending(&self) -> usize;

    /// Best-effort protocol-level shutdown notification. Errors are ignored.
    fn shutdown(&mut self);

    /// Peer identity material; empty before the handshake completes.
    fn peer(&self) -> PeerMaterial;
}

enum Phase<S> {
    /// Created but no handshake step taken yet.
    Start { ssl: Ssl, stream: S, role: Role },
    Mid(MidHandshakeSslStream<S>),
    Open(SslStream<S>),
}

/// [`SecureChannel`] over an OpenSSL stream.
///
/// The wrapped transport must be nonblocking; would-block conditions surface
/// as `WantRead`/`WantWrite` and are never retried internally.
pub struct OpenSslChannel<S> {
    phase: Option<Phase<S>>,
    reneg_allowed: bool,
}

impl<S: Read + Write> OpenSslChannel<S> {
    pub fn new(ssl: Ssl, stream: S, role: Role, reneg_allowed: bool) -> Self {
        OpenSslChannel {
            phase: Some(Phase::Start { ssl, stream, role }),
            reneg_allowed,
        }
    }

    fn map_error(&self, e: &openssl::ssl::Error) -> IoStatus {
        match e.code() {
            ErrorCode::ZERO_RETURN => IoStatus::Shutdown,
            ErrorCode::WANT_READ => IoStatus::WantRead,
            ErrorCode::WANT_WRITE => IoStatus::WantWrite,
            ErrorCode::SYSCALL => match e.io_error() {
                Some(io) if io.kind() == std::io::ErrorKind::WouldBlock => IoStatus::WantRead,
                Some(io) => IoStatus::Fatal(io.to_string()),
                None => IoStatus::Fatal("transport EOF violates the TLS protocol".to_string()),
            },
            _ => {
                if !self.reneg_allowed && is_renegotiation_error(e) {
                    IoStatus::Renegotiation
                } else {
                    IoStatus::Fatal(e.to_string())
                }
            }
        }
    }
}

fn is_renegotiation_error(e: &openssl::ssl::Error) -> bool {
    e.ssl_error().is_some_and(|stack| {
        stack
            .errors()
            .iter()
            .any(|err| err.reason().is_some_and(|r| r.contains("renegotiation")))
    })
}

impl<S: Read + Write> SecureChannel for OpenSslChannel<S> {
    fn handshake(&mut self) -> HandshakeStatus {
        let phase = match self.phase.take() {
            Some(phase) => phase,
            None => return HandshakeStatus::Failed("TLS state already discarded".to_string()),
        };

        let result = match phase {
            Phase::Start { ssl, stream, role } => match role {
                Role::Inbound => ssl.accept(stream),
                Role::Outbound => ssl.connect(stream),
            },
            Phase::Mid(mid) => mid.handshake(),
            Phase::Open(stream) => {
                self.phase = Some(Phase::Open(stream));
                return HandshakeStatus::Done;
            }
        };

        match result {
            Ok(stream) => {
                self.phase = Some(Phase::Open(stream));
                HandshakeStatus::Done
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                let status = match mid.error().code() {
                    ErrorCode::WANT_WRITE => HandshakeStatus::WantWrite,
                    _ => HandshakeStatus::WantRead,
                };
                self.phase = Some(Phase::Mid(mid));
                status
            }
            Err(HandshakeError::Failure(mid)) => HandshakeStatus::Failed(mid.error().to_string()),
            Err(HandshakeError::SetupFailure(stack)) => HandshakeStatus::Failed(stack.to_string()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> IoStatus {
        match self.phase.as_mut() {
            Some(Phase::Open(stream)) => match stream.ssl_read(buf) {
                Ok(n) => IoStatus::Bytes(n),
                Err(e) => self.map_error(&e),
            },
            _ => IoStatus::Fatal("TLS channel is not open".to_string()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoStatus {
        match self.phase.as_mut() {
            Some(Phase::Open(stream)) => match stream.ssl_write(buf) {
                Ok(n) => IoStatus::Bytes(n),
                Err(e) => self.map_error(&e),
            },
            _ => IoStatus::Fatal("TLS channel is not open".to_string()),
        }
    }

    fn pending(&self) -> usize {
        match self.phase.as_ref() {
            Some(Phase::Open(stream)) => stream.ssl().pending(),
            _ => 0,
        }
    }

    fn shutdown(&mut self) {
        if let Some(Phase::Open(stream)) = self.phase.as_mut() {
            let _ = stream.shutdown();
        }
    }

    fn peer(&self) -> PeerMaterial {
        let ssl = match self.phase.as_ref() {
            Some(Phase::Open(stream)) => stream.ssl(),
            _ => return PeerMaterial::default(),
        };

        let leaf = ssl.peer_certificate();
        let chain = ssl
            .peer_cert_chain()
            .map(|stack| stack.iter().map(|cert| cert.to_owned()).collect())
            .unwrap_or_default();

        let verify = ssl.verify_result();
        let self_signed =
            verify.as_raw() == openssl_sys::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT;
        let error = if verify == X509VerifyResult::OK {
            None
        } else {
            Some(verify.error_string().to_string())
        };

        PeerMaterial {
            leaf,
            chain,
            verify: VerifyOutcome { self_signed, error },
        }
    }
}
