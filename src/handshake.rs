//! Readiness-driven handshake progression
//!
//! One call drives exactly one protocol step and translates its outcome into
//! event-mask changes. The waiting direction always parks the opposite
//! direction, otherwise a peer that stalls mid-handshake would keep the
//! descriptor hot in the poller.

use crate::cert::{verify_chain, VerifyPolicy};
use crate::channel::HandshakeStatus;
use crate::event::{EventMask, EventSink};
use crate::hook::HookError;
use crate::session::{Session, SessionState};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    InProgress,
    Complete,
}

/// Advance the handshake on `fd` by one step.
///
/// On completion the peer chain is verified, certificate records attach to
/// the session and the mask switches to read-driven steady state with a
/// trial write so output queued during the handshake flushes immediately.
/// On failure the session is torn down and the error propagates to the
/// caller, which must drop the connection.
pub(crate) fn step(
    fd: usize,
    session: &mut Session,
    policy: &VerifyPolicy,
    events: &mut dyn EventSink,
) -> Result<Progress, HookError> {
    let channel = session.channel.as_mut().ok_or(HookError::NoSession)?;

    match channel.handshake() {
        HandshakeStatus::WantRead => {
            events.change_mask(fd, EventMask::new().poll_read().no_write());
            Ok(Progress::InProgress)
        }
        HandshakeStatus::WantWrite => {
            events.change_mask(fd, EventMask::new().no_read().single_write());
            Ok(Progress::InProgress)
        }
        HandshakeStatus::Done => {
            let (leaf, chain) = verify_chain(&channel.peer(), policy);
            debug!(
                fd,
                fingerprint = %leaf.fingerprint,
                trusted = leaf.trust == crate::cert::TrustState::Trusted,
                "handshake complete"
            );
            session.cert = Some(Arc::new(leaf));
            session.chain = chain.into_iter().map(Arc::new).collect();
            session.state = SessionState::Open;
            events.change_mask(
                fd,
                EventMask::new().poll_read().no_write().trial_write(),
            );
            Ok(Progress::Complete)
        }
        HandshakeStatus::Failed(reason) => {
            warn!(fd, peer = ?session.peer(), "handshake failed: {}", reason);
            session.close();
            Err(HookError::Handshake(reason))
        }
    }
}
