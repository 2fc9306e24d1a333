//! Per-connection session records
//!
//! Sessions live in a flat table indexed by socket descriptor, sized once at
//! startup from the process descriptor limit. Descriptors are reused by the
//! OS, so installing a new channel always clears whatever a previous
//! connection left behind, and every access is bounds-checked: an
//! out-of-range descriptor is a caller bug reported as a typed error, never
//! an out-of-bounds index.

use crate::cert::CertificateRecord;
use crate::channel::SecureChannel;
use std::net::SocketAddr;
use std::sync::Arc;

/// Which side of the connection we are, fixed at session creation. Selects
/// the handshake primitive (accept vs connect) and the TLS context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Inbound,
    Outbound,
}

/// Session lifecycle state.
///
/// Transitions are strictly Idle→Handshaking→Open, with any state falling
/// back to Idle on close or failure. Idle implies no crypto channel exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Open,
}

/// Session table access errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("descriptor {fd} out of range for session table of capacity {capacity}")]
    DescriptorOutOfRange { fd: usize, capacity: usize },
}

/// One connection's TLS state.
pub struct Session {
    pub(crate) channel: Option<Box<dyn SecureChannel>>,
    pub(crate) state: SessionState,
    role: Role,
    /// The application has plaintext queued that has not been flushed yet.
    pub(crate) pending_write: bool,
    pub(crate) cert: Option<Arc<CertificateRecord>>,
    pub(crate) chain: Vec<Arc<CertificateRecord>>,
    pub(crate) peer: Option<SocketAddr>,
}

impl Session {
    fn new() -> Self {
        Session {
            channel: None,
            state: SessionState::Idle,
            role: Role::Inbound,
            pending_write: false,
            cert: None,
            chain: Vec::new(),
            peer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The peer's leaf certificate record, available once the handshake has
    /// completed. The reference stays valid after the session closes.
    pub fn certificate(&self) -> Option<Arc<CertificateRecord>> {
        self.cert.clone()
    }

    /// Chain certificates beyond the leaf.
    pub fn chain(&self) -> &[Arc<CertificateRecord>] {
        &self.chain
    }

    /// Install a freshly constructed channel, clearing any stale state a
    /// previous connection on this descriptor left behind.
    pub(crate) fn install(
        &mut self,
        channel: Box<dyn SecureChannel>,
        role: Role,
        peer: SocketAddr,
    ) {
        self.close();
        self.channel = Some(channel);
        self.role = role;
        self.peer = Some(peer);
        self.state = SessionState::Handshaking;
    }

    /// Release the crypto channel (sending a best-effort shutdown
    /// notification first) and fall back to Idle. Safe to call from any
    /// state; a second close is a no-op.
    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.shutdown();
        }
        self.state = SessionState::Idle;
        self.pending_write = false;
        self.cert = None;
        self.chain.clear();
        self.peer = None;
    }
}

/// Fixed-capacity, descriptor-indexed session arena.
pub struct SessionTable {
    slots: Vec<Session>,
}

impl SessionTable {
    /// `capacity` is the maximum open-descriptor count, fixed for the
    /// process lifetime.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Session::new);
        SessionTable { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, fd: usize) -> Result<&Session, SessionError> {
        self.slots.get(fd).ok_or(SessionError::DescriptorOutOfRange {
            fd,
            capacity: self.slots.len(),
        })
    }

    pub fn get_mut(&mut self, fd: usize) -> Result<&mut Session, SessionError> {
        let capacity = self.slots.len();
        self.slots
            .get_mut(fd)
            .ok_or(SessionError::DescriptorOutOfRange { fd, capacity })
    }

    /// Close the session on `fd`, if any. Idempotent.
    pub fn close(&mut self, fd: usize) -> Result<(), SessionError> {
        self.get_mut(fd)?.close();
        Ok(())
    }

    /// Drop every live session. Used at teardown.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.close();
        }
    }
}
