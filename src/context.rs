//! TLS context ownership and rehash
//!
//! OpenSSL forces two contexts, one per handshake role: default behavior
//! differs between acceptor and initiator even when they share the same
//! certificate material, so both are configured side by side from the same
//! [`TlsConfig`]. A rehash builds a complete replacement manager and swaps
//! it in only once everything validated and loaded; a failure reports a
//! [`ConfigError`] and leaves the previous contexts (and every live session,
//! which snapshotted its context at creation) untouched.

use crate::cert::VerifyPolicy;
use crate::channel::OpenSslChannel;
use crate::config::{ConfigError, CrlMode, TlsConfig};
use crate::session::Role;
use openssl::dh::Dh;
use openssl::error::ErrorStack;
use openssl::ssl::{
    Ssl, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslMode, SslOptions,
    SslSessionCacheMode, SslVerifyMode,
};
use openssl::x509::store::X509Lookup;
use openssl::x509::verify::X509VerifyFlags;
use std::io::{Read, Write};
use tracing::{debug, warn};

pub struct ContextManager {
    server: SslContext,
    client: SslContext,
    policy: VerifyPolicy,
    renegotiation: bool,
}

impl ContextManager {
    pub fn new(config: &TlsConfig) -> Result<Self, ConfigError> {
        Self::build(config)
    }

    /// Re-read every configuration field and reload certificate, key, CA,
    /// CRL and DH material into fresh contexts. All-or-nothing: any failure
    /// leaves the current contexts in service.
    pub fn rehash(&mut self, config: &TlsConfig) -> Result<(), ConfigError> {
        let next = Self::build(config)?;
        *self = next;
        debug!("TLS contexts rebuilt");
        Ok(())
    }

    pub fn policy(&self) -> &VerifyPolicy {
        &self.policy
    }

    pub fn renegotiation_allowed(&self) -> bool {
        self.renegotiation
    }

    /// Build a channel for a new connection, snapshotting the role's context
    /// so later rehashes cannot disturb this session.
    pub fn new_channel<S: Read + Write>(
        &self,
        role: Role,
        stream: S,
    ) -> Result<OpenSslChannel<S>, ErrorStack> {
        let ctx = match role {
            Role::Inbound => &self.server,
            Role::Outbound => &self.client,
        };
        let ssl = Ssl::new(ctx)?;
        Ok(OpenSslChannel::new(ssl, stream, role, self.renegotiation))
    }

    fn build(config: &TlsConfig) -> Result<Self, ConfigError> {
        // Validate the pure policy fields before loading any material.
        let policy = VerifyPolicy::from_config(config)?;
        let crlmode = CrlMode::parse(&config.crlmode)?;

        let server = Self::build_ctx(SslMethod::tls_server(), config, crlmode)?;
        let client = Self::build_ctx(SslMethod::tls_client(), config, crlmode)?;

        Ok(ContextManager {
            server,
            client,
            policy,
            renegotiation: config.renegotiation,
        })
    }

    fn build_ctx(
        method: SslMethod,
        config: &TlsConfig,
        crlmode: CrlMode,
    ) -> Result<SslContext, ConfigError> {
        let mut builder = SslContextBuilder::new(method)?;

        builder.set_mode(SslMode::ENABLE_PARTIAL_WRITE | SslMode::ACCEPT_MOVING_WRITE_BUFFER);

        // Request and record the peer chain but accept it unconditionally:
        // trust classification is session metadata read back from the verify
        // result after the handshake, not an enforcement point.
        builder.set_verify_callback(SslVerifyMode::PEER, |_preverified, _ctx| true);

        // Session resumption is disabled outright.
        builder.set_session_cache_mode(SslSessionCacheMode::OFF);

        let mut options = SslOptions::NO_TICKET;
        if !config.compression {
            options |= SslOptions::NO_COMPRESSION;
        }
        if !config.sslv3 {
            options |= SslOptions::NO_SSLV3;
        }
        if !config.tlsv1 {
            options |= SslOptions::NO_TLSV1;
        }
        if !config.renegotiation {
            options |= SslOptions::NO_RENEGOTIATION;
        }
        builder.set_options(options);

        if let Some(ciphers) = config.ciphers.as_deref().filter(|c| !c.is_empty()) {
            if let Err(e) = builder.set_cipher_list(ciphers) {
                warn!("Can't set cipher list to {}: {}", ciphers, e);
            }
        }

        // Identity material failures are logged and survived: a daemon with a
        // bad certificate path should come up and tell the operator, not die.
        if !config.certfile.as_os_str().is_empty() {
            if let Err(e) = builder.set_certificate_chain_file(&config.certfile) {
                warn!(
                    "Can't read certificate file {}: {}",
                    config.certfile.display(),
                    e
                );
            }
        }
        if !config.keyfile.as_os_str().is_empty() {
            if let Err(e) = builder.set_private_key_file(&config.keyfile, SslFiletype::PEM) {
                warn!("Can't read key file {}: {}", config.keyfile.display(), e);
            }
        }
        if !config.cafile.as_os_str().is_empty() {
            if let Err(e) = builder.set_ca_file(&config.cafile) {
                warn!(
                    "Can't read CA list from {}; only a problem if you need peer \
                     certificate verification: {}",
                    config.cafile.display(),
                    e
                );
            }
        }

        // CRL material, unlike identity material, is load-bearing for the
        // revocation policy: failures abort the rehash.
        if config.crlfile.is_some() || config.crlpath.is_some() {
            let crl_error = |source: ErrorStack| ConfigError::CrlLoad {
                file: config
                    .crlfile
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                path: config
                    .crlpath
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                source,
            };

            let store = builder.cert_store_mut();
            if let Some(file) = &config.crlfile {
                let lookup = store.add_lookup(X509Lookup::file()).map_err(crl_error)?;
                lookup
                    .load_crl_file(file, SslFiletype::PEM)
                    .map_err(crl_error)?;
            }
            if let Some(dir) = &config.crlpath {
                let lookup = store
                    .add_lookup(X509Lookup::hash_dir())
                    .map_err(crl_error)?;
                lookup
                    .add_dir(&dir.to_string_lossy(), SslFiletype::PEM)
                    .map_err(crl_error)?;
            }

            let flags = match crlmode {
                CrlMode::Chain => X509VerifyFlags::CRL_CHECK | X509VerifyFlags::CRL_CHECK_ALL,
                CrlMode::Leaf => X509VerifyFlags::CRL_CHECK,
            };
            store.set_flags(flags).map_err(crl_error)?;
        }

        if let Some(dhfile) = &config.dhfile {
            let pem = std::fs::read(dhfile)
                .map_err(|e| ConfigError::DhFile(dhfile.clone(), e))?;
            match Dh::params_from_pem(&pem) {
                Ok(dh) => {
                    if let Err(e) = builder.set_tmp_dh(&dh) {
                        warn!("Couldn't set DH parameters {}: {}", dhfile.display(), e);
                    }
                }
                Err(e) => warn!("Couldn't parse DH parameters {}: {}", dhfile.display(), e),
            }
        }

        if let Some(curve) = config.ecdhcurve.as_deref().filter(|c| !c.is_empty()) {
            if let Err(e) = builder.set_groups_list(curve) {
                warn!("Unknown curve \"{}\": {}", curve, e);
            }
        }

        Ok(builder.build())
    }
}
