//! The TLS I/O hook
//!
//! [`TlsHook`] is the surface the event loop talks to: it owns the session
//! table and the TLS contexts, and translates readiness callbacks into
//! handshake steps and record-layer reads and writes. Every callback runs
//! one bounded pass and reports, through the returned status and the
//! [`EventSink`], what the caller should do next; nothing here blocks or
//! retries internally.

use crate::cert::CertificateRecord;
use crate::channel::IoStatus;
use crate::config::{ConfigError, TlsConfig};
use crate::context::ContextManager;
use crate::event::{EventMask, EventSink};
use crate::handshake::{self, Progress};
use crate::session::{Role, SessionError, SessionState, SessionTable};
use bytes::{Buf, BytesMut};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The descriptor has no live TLS session.
    #[error("no TLS session on this descriptor")]
    NoSession,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("Renegotiation is not allowed")]
    Renegotiation,
    #[error("{0}")]
    Io(String),
}

/// Result of one read-readiness pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Plaintext bytes were appended to the receive queue.
    Data(usize),
    /// Nothing to deliver yet; the mask says what to wait for.
    NoData,
    /// The peer shut the connection down cleanly. The session is closed.
    Closed,
}

/// Result of one write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The whole send queue was flushed.
    Sent,
    /// A prefix was flushed; the queue retains the rest.
    Partial,
    /// Nothing could be written yet; retry on the requested readiness.
    TryLater,
}

/// Session-layer TLS for a readiness-driven server.
pub struct TlsHook {
    sessions: SessionTable,
    contexts: ContextManager,
    /// Scratch space for one decrypted read pass.
    read_buffer: Vec<u8>,
}

impl TlsHook {
    /// `capacity` is the process descriptor limit; the session table is
    /// sized once and never grows.
    pub fn new(capacity: usize, config: &TlsConfig) -> Result<Self, ConfigError> {
        Ok(TlsHook {
            sessions: SessionTable::new(capacity),
            contexts: ContextManager::new(config)?,
            read_buffer: vec![0; config.recv_buffer_size],
        })
    }

    pub fn capacity(&self) -> usize {
        self.sessions.capacity()
    }

    /// Rebuild contexts and policy from `config`. Existing sessions keep the
    /// contexts they were created with; only new connections see the change.
    /// On error nothing changes.
    pub fn rehash(&mut self, config: &TlsConfig) -> Result<(), ConfigError> {
        self.contexts.rehash(config)?;
        self.read_buffer.resize(config.recv_buffer_size, 0);
        Ok(())
    }

    /// Begin serving an accepted connection on `fd` and take the first
    /// handshake step.
    pub fn accept<S: Read + Write + 'static>(
        &mut self,
        fd: usize,
        stream: S,
        peer: SocketAddr,
        events: &mut dyn EventSink,
    ) -> Result<(), HookError> {
        self.start(fd, Role::Inbound, stream, peer, events)
    }

    /// Begin an outbound connection on `fd` and take the first handshake
    /// step.
    pub fn connect<S: Read + Write + 'static>(
        &mut self,
        fd: usize,
        stream: S,
        peer: SocketAddr,
        events: &mut dyn EventSink,
    ) -> Result<(), HookError> {
        self.start(fd, Role::Outbound, stream, peer, events)
    }

    fn start<S: Read + Write + 'static>(
        &mut self,
        fd: usize,
        role: Role,
        stream: S,
        peer: SocketAddr,
        events: &mut dyn EventSink,
    ) -> Result<(), HookError> {
        let channel = self
            .contexts
            .new_channel(role, stream)
            .map_err(|e| HookError::Io(e.to_string()))?;
        let policy = self.contexts.policy();
        let session = self.sessions.get_mut(fd)?;
        session.install(Box::new(channel), role, peer);
        debug!(fd, ?role, %peer, "session installed");
        handshake::step(fd, session, policy, events)?;
        Ok(())
    }

    /// Read-readiness callback. Drives the handshake if one is in flight,
    /// otherwise decrypts one pass of input into `recvq`.
    ///
    /// When the record layer still holds buffered plaintext after the pass,
    /// a trial read is scheduled so it drains without waiting for transport
    /// readiness that may never come.
    pub fn on_readable(
        &mut self,
        fd: usize,
        recvq: &mut BytesMut,
        events: &mut dyn EventSink,
    ) -> Result<ReadStatus, HookError> {
        let policy = self.contexts.policy();
        let session = self.sessions.get_mut(fd)?;
        if session.state() == SessionState::Idle {
            return Err(HookError::NoSession);
        }

        if session.state() == SessionState::Handshaking {
            match handshake::step(fd, session, policy, events)? {
                Progress::InProgress => return Ok(ReadStatus::NoData),
                Progress::Complete => {}
            }
        }

        let pending_write = session.pending_write;
        let channel = session.channel.as_mut().ok_or(HookError::NoSession)?;
        match channel.read(&mut self.read_buffer) {
            IoStatus::Bytes(n) => {
                recvq.extend_from_slice(&self.read_buffer[..n]);
                // Output queued during the handshake or an earlier stalled
                // write still needs a write-readiness shot.
                if pending_write {
                    events.change_mask(fd, EventMask::new().poll_read().single_write());
                }
                if channel.pending() > 0 {
                    events.change_mask(fd, EventMask::new().trial_read());
                }
                Ok(ReadStatus::Data(n))
            }
            IoStatus::Shutdown => {
                debug!(fd, "connection closed by peer");
                session.close();
                Ok(ReadStatus::Closed)
            }
            IoStatus::WantRead => {
                events.change_mask(fd, EventMask::new().poll_read());
                Ok(ReadStatus::NoData)
            }
            IoStatus::WantWrite => {
                events.change_mask(fd, EventMask::new().no_read().single_write());
                Ok(ReadStatus::NoData)
            }
            IoStatus::Renegotiation => {
                session.close();
                Err(HookError::Renegotiation)
            }
            IoStatus::Fatal(msg) => {
                session.close();
                Err(HookError::Io(msg))
            }
        }
    }

    /// Flush as much of `sendq` as the connection accepts. Flushed bytes are
    /// consumed from the front of the queue; on a partial write the caller
    /// keeps the retained suffix and retries on the requested readiness.
    pub fn write(
        &mut self,
        fd: usize,
        sendq: &mut BytesMut,
        events: &mut dyn EventSink,
    ) -> Result<WriteStatus, HookError> {
        let policy = self.contexts.policy();
        let session = self.sessions.get_mut(fd)?;
        if session.state() == SessionState::Idle {
            return Err(HookError::NoSession);
        }

        session.pending_write = true;

        if session.state() == SessionState::Handshaking {
            match handshake::step(fd, session, policy, events)? {
                Progress::InProgress => return Ok(WriteStatus::TryLater),
                Progress::Complete => {}
            }
        }

        if sendq.is_empty() {
            session.pending_write = false;
            events.change_mask(fd, EventMask::new().poll_read().no_write());
            return Ok(WriteStatus::Sent);
        }

        let len = sendq.len();
        let channel = session.channel.as_mut().ok_or(HookError::NoSession)?;
        match channel.write(&sendq[..]) {
            IoStatus::Bytes(n) if n == len => {
                sendq.advance(n);
                session.pending_write = false;
                events.change_mask(fd, EventMask::new().poll_read().no_write());
                Ok(WriteStatus::Sent)
            }
            IoStatus::Bytes(n) => {
                sendq.advance(n);
                // Read interest stays as it was; a stalled write must not
                // stop inbound data from draining.
                events.change_mask(fd, EventMask::new().single_write());
                Ok(WriteStatus::Partial)
            }
            IoStatus::WantWrite => {
                events.change_mask(fd, EventMask::new().single_write());
                Ok(WriteStatus::TryLater)
            }
            IoStatus::WantRead => {
                events.change_mask(fd, EventMask::new().poll_read());
                Ok(WriteStatus::TryLater)
            }
            IoStatus::Shutdown => {
                session.close();
                Err(HookError::Io("connection closed during write".to_string()))
            }
            IoStatus::Renegotiation => {
                session.close();
                Err(HookError::Renegotiation)
            }
            IoStatus::Fatal(msg) => {
                session.close();
                Err(HookError::Io(msg))
            }
        }
    }

    pub fn session_state(&self, fd: usize) -> Result<SessionState, HookError> {
        Ok(self.sessions.get(fd)?.state())
    }

    /// The peer's leaf certificate record, once the handshake on `fd`
    /// completed. The `Arc` stays valid after the session closes.
    pub fn certificate(&self, fd: usize) -> Result<Option<Arc<CertificateRecord>>, HookError> {
        Ok(self.sessions.get(fd)?.certificate())
    }

    /// Chain certificate records beyond the leaf.
    pub fn chain(&self, fd: usize) -> Result<Vec<Arc<CertificateRecord>>, HookError> {
        Ok(self.sessions.get(fd)?.chain().to_vec())
    }

    /// Tear down the session on `fd`, sending a best-effort close_notify.
    /// Idempotent.
    pub fn close(&mut self, fd: usize) -> Result<(), HookError> {
        self.sessions.close(fd)?;
        Ok(())
    }

    /// Close every live session. Used at shutdown.
    pub fn shutdown_all(&mut self) {
        self.sessions.clear();
    }

    #[cfg(test)]
    pub(crate) fn install_for_test(
        &mut self,
        fd: usize,
        channel: Box<dyn crate::channel::SecureChannel>,
        role: Role,
    ) {
        let peer = "127.0.0.1:6697".parse().unwrap();
        self.sessions.get_mut(fd).unwrap().install(channel, role, peer);
    }

    #[cfg(test)]
    pub(crate) fn force_open_for_test(&mut self, fd: usize) {
        self.sessions.get_mut(fd).unwrap().state = SessionState::Open;
    }
}
