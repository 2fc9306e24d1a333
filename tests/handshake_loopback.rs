//! Full-handshake integration tests over an in-memory transport.
//!
//! Two sessions in one table, joined by a crossed byte pipe that reports
//! WouldBlock when its buffer is empty, drive a real OpenSSL handshake one
//! readiness callback at a time without any sockets or threads.

use bytes::BytesMut;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use tempfile::TempDir;
use tlshook::{EventMask, EventSink, ReadStatus, SessionState, TlsConfig, TlsHook, TrustState, WriteStatus};

const SERVER_FD: usize = 0;
const CLIENT_FD: usize = 1;

/// One direction of the in-memory transport.
type Buffer = Rc<RefCell<VecDeque<u8>>>;

/// Nonblocking stream endpoint: reads drain one buffer, writes fill the
/// other, and an empty read reports WouldBlock like a real socket would.
struct PipeEnd {
    incoming: Buffer,
    outgoing: Buffer,
}

fn pipe() -> (PipeEnd, PipeEnd) {
    let a = Buffer::default();
    let b = Buffer::default();
    (
        PipeEnd {
            incoming: a.clone(),
            outgoing: b.clone(),
        },
        PipeEnd {
            incoming: b,
            outgoing: a,
        },
    )
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut incoming = self.incoming.borrow_mut();
        if incoming.is_empty() {
            return Err(std::io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(incoming.len());
        for slot in buf.iter_mut().take(n) {
            *slot = incoming.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.outgoing.borrow_mut().extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Mask changes are irrelevant here; the test drives both ends directly.
struct NullSink;

impl EventSink for NullSink {
    fn change_mask(&mut self, _fd: usize, _mask: EventMask) {}
}

fn generate_identity(cn: &str) -> (PKey<Private>, X509) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(127, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (key, builder.build())
}

/// Write a fresh self-signed identity to disk and return a config using it.
fn config_with_identity(dir: &TempDir) -> TlsConfig {
    let (key, cert) = generate_identity("loopback.test");
    let certfile = dir.path().join("cert.pem");
    let keyfile = dir.path().join("key.pem");
    std::fs::write(&certfile, cert.to_pem().unwrap()).unwrap();
    std::fs::write(&keyfile, key.private_key_to_pem_pkcs8().unwrap()).unwrap();

    TlsConfig {
        certfile,
        keyfile,
        ..TlsConfig::default()
    }
}

fn peer_addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// Stand up both ends of a connected pair and run the handshake to
/// completion by alternating readiness callbacks.
fn handshaken_pair(config: &TlsConfig) -> (TlsHook, BytesMut, BytesMut) {
    let mut hook = TlsHook::new(8, config).unwrap();
    let mut sink = NullSink;
    let (server_end, client_end) = pipe();

    hook.accept(SERVER_FD, server_end, peer_addr(50001), &mut sink)
        .unwrap();
    hook.connect(CLIENT_FD, client_end, peer_addr(6697), &mut sink)
        .unwrap();

    let mut server_recvq = BytesMut::new();
    let mut client_recvq = BytesMut::new();
    for _ in 0..32 {
        if hook.session_state(SERVER_FD).unwrap() == SessionState::Open
            && hook.session_state(CLIENT_FD).unwrap() == SessionState::Open
        {
            break;
        }
        if hook.session_state(SERVER_FD).unwrap() == SessionState::Handshaking {
            hook.on_readable(SERVER_FD, &mut server_recvq, &mut sink)
                .unwrap();
        }
        if hook.session_state(CLIENT_FD).unwrap() == SessionState::Handshaking {
            hook.on_readable(CLIENT_FD, &mut client_recvq, &mut sink)
                .unwrap();
        }
    }

    assert_eq!(hook.session_state(SERVER_FD).unwrap(), SessionState::Open);
    assert_eq!(hook.session_state(CLIENT_FD).unwrap(), SessionState::Open);
    (hook, server_recvq, client_recvq)
}

#[test]
fn handshake_completes_and_classifies_the_self_signed_peer() {
    let dir = TempDir::new().unwrap();
    let config = config_with_identity(&dir);
    let (hook, _, _) = handshaken_pair(&config);

    // The client sees the server's self-signed identity.
    let record = hook.certificate(CLIENT_FD).unwrap().expect("leaf record");
    assert!(record.subject.contains("CN=loopback.test"));
    assert_eq!(record.trust, TrustState::UnknownSigner);
    assert!(record.invalid);
    // Default digest is md5, 16 bytes hex-encoded.
    assert_eq!(record.fingerprint.len(), 32);
}

#[test]
fn plaintext_crosses_the_encrypted_relay_intact() {
    let dir = TempDir::new().unwrap();
    let config = config_with_identity(&dir);
    let (mut hook, mut server_recvq, _) = handshaken_pair(&config);
    let mut sink = NullSink;

    let mut sendq = BytesMut::from(&b"PING :loopback\r\n"[..]);
    let status = hook.write(CLIENT_FD, &mut sendq, &mut sink).unwrap();
    assert_eq!(status, WriteStatus::Sent);
    assert!(sendq.is_empty());

    let status = hook
        .on_readable(SERVER_FD, &mut server_recvq, &mut sink)
        .unwrap();
    assert_eq!(status, ReadStatus::Data(16));
    assert_eq!(&server_recvq[..], b"PING :loopback\r\n");
}

#[test]
fn large_payloads_survive_record_fragmentation() {
    let dir = TempDir::new().unwrap();
    let config = config_with_identity(&dir);
    let (mut hook, mut server_recvq, _) = handshaken_pair(&config);
    let mut sink = NullSink;

    // Larger than both one TLS record and one read pass.
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let mut sendq = BytesMut::from(&payload[..]);
    while !sendq.is_empty() {
        hook.write(CLIENT_FD, &mut sendq, &mut sink).unwrap();
    }

    for _ in 0..256 {
        if server_recvq.len() >= payload.len() {
            break;
        }
        hook.on_readable(SERVER_FD, &mut server_recvq, &mut sink)
            .unwrap();
    }
    assert_eq!(&server_recvq[..], &payload[..]);
}

#[test]
fn close_notify_surfaces_as_a_clean_close() {
    let dir = TempDir::new().unwrap();
    let config = config_with_identity(&dir);
    let (mut hook, mut server_recvq, _) = handshaken_pair(&config);
    let mut sink = NullSink;

    hook.close(CLIENT_FD).unwrap();
    assert_eq!(hook.session_state(CLIENT_FD).unwrap(), SessionState::Idle);

    let status = hook
        .on_readable(SERVER_FD, &mut server_recvq, &mut sink)
        .unwrap();
    assert_eq!(status, ReadStatus::Closed);
    assert!(server_recvq.is_empty());
    assert_eq!(hook.session_state(SERVER_FD).unwrap(), SessionState::Idle);
}

#[test]
fn certificate_record_outlives_the_session() {
    let dir = TempDir::new().unwrap();
    let config = config_with_identity(&dir);
    let (mut hook, _, _) = handshaken_pair(&config);

    let record = hook.certificate(CLIENT_FD).unwrap().expect("leaf record");
    hook.close(CLIENT_FD).unwrap();
    assert!(hook.certificate(CLIENT_FD).unwrap().is_none());

    // The caller's Arc still has the full record.
    assert!(record.subject.contains("CN=loopback.test"));
    assert!(!record.fingerprint.is_empty());
}

#[test]
fn key_size_policy_flags_an_undersized_peer_without_dropping_it() {
    let dir = TempDir::new().unwrap();
    let config = TlsConfig {
        peer_keysize_min: Some("RSA:4096".to_string()),
        ..config_with_identity(&dir)
    };
    let (hook, _, _) = handshaken_pair(&config);

    // The 2048-bit identity violates the policy; the connection stands and
    // the violation is metadata on the record.
    assert_eq!(hook.session_state(CLIENT_FD).unwrap(), SessionState::Open);
    let record = hook.certificate(CLIENT_FD).unwrap().expect("leaf record");
    assert!(record.error.contains("'RSA' key must be >= '4096' bits"));
}
