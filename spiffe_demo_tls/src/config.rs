//! Build [`rustls`] configurations for either end of an mTLS channel.
//!
//! Both builders take the identity source and the authorization rule for
//! the peer and return a configuration that:
//!
//! * presents the local SVID current at handshake time ([`SvidResolver`]);
//! * requires the peer to present one too;
//! * verifies it against the bundle of the peer's trust domain and the
//!   rule ([`SpiffeClientVerifier`], [`SpiffeServerVerifier`]).
//!
//! Session resumption is turned off so that every connection gets a full
//! verification against the bundles and rule in force at the time.

use rustls::client::Resumption;
use rustls::server::NoServerSessionStorage;
use rustls::{ClientConfig, ServerConfig};
use spiffe_demo_identity::IdentitySource;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::crypto_provider::crypto_provider;
use crate::policy::Authorizer;
use crate::resolver::SvidResolver;
use crate::verifier::{SpiffeClientVerifier, SpiffeServerVerifier};

/// Handshake timeout used when none is configured.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type returned by the configuration builders.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Wrapper for rustls::Error
    #[error("{0}")]
    TLSError(#[from] rustls::Error),
}

/// Command line arguments for an mTLS endpoint.
#[derive(clap::Args, Debug)]
#[group(id = "spiffe_demo_tls_args")]
pub struct MtlsArgs {
    /// Rule for the peer's SPIFFE ID.
    #[arg(
        short = 'a',
        long,
        help = "The SPIFFE ID that is authorized to talk to/from this service: spiffe://td/path, spiffe://td for a whole trust domain, a comma separated list, or * for anyone."
    )]
    pub authorized_spiffe: Authorizer,

    /// Handshake deadline.
    #[arg(
        long,
        default_value = "10s",
        value_parser = humantime::parse_duration,
        help = "How long a TLS handshake may take before the connection is dropped."
    )]
    pub handshake_timeout: Duration,
}

/// A [`ServerConfig`] that requires clients to present an SVID allowed by
/// `authorizer`.
pub fn server_config(
    source: Arc<IdentitySource>,
    authorizer: Arc<Authorizer>,
) -> Result<ServerConfig, ConfigError> {
    let crypto_provider = crypto_provider();
    let verifier = Arc::new(SpiffeClientVerifier::new(
        Arc::clone(&source),
        authorizer,
        Arc::clone(&crypto_provider),
    ));
    let resolver = Arc::new(SvidResolver::new(source, Arc::clone(&crypto_provider)));
    let mut sc = ServerConfig::builder_with_provider(crypto_provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(resolver);
    sc.session_storage = Arc::new(NoServerSessionStorage {});
    sc.send_tls13_tickets = 0;
    Ok(sc)
}

/// A [`ClientConfig`] that presents our SVID and only talks to servers
/// allowed by `authorizer`.
pub fn client_config(
    source: Arc<IdentitySource>,
    authorizer: Arc<Authorizer>,
) -> Result<ClientConfig, ConfigError> {
    let crypto_provider = crypto_provider();
    let verifier = Arc::new(SpiffeServerVerifier::new(
        Arc::clone(&source),
        authorizer,
        Arc::clone(&crypto_provider),
    ));
    let resolver = Arc::new(SvidResolver::new(source, Arc::clone(&crypto_provider)));
    let mut cc = ClientConfig::builder_with_provider(crypto_provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_cert_resolver(resolver);
    cc.resumption = Resumption::disabled();
    cc.enable_sni = false;
    Ok(cc)
}
