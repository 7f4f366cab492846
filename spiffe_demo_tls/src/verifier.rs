//! Certificate verifiers that authenticate the peer against the trust bundle
//! of the peer's own trust domain and then authorize its SPIFFE ID.
//!
//! Bundles are looked up in the [`IdentitySource`] on every handshake, so
//! a verifier never needs rebuilding after a bundle rotation. Server names
//! are not checked: the SPIFFE ID is the identity.
//!
//! Failures map onto TLS alerts as follows:
//!
//! | Failure | Error | Alert |
//! |---------|-------|-------|
//! | No bundle for the peer's trust domain | [`CertificateError::UnknownIssuer`] | `unknown_ca` |
//! | Chain does not verify, or is expired | whatever webpki reports | `bad_certificate` and friends |
//! | No SPIFFE ID, or the [`Authorizer`] says no | [`CertificateError::ApplicationVerificationFailure`] | `access_denied` |

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, RootCertStore};
use spiffe_demo_identity::{IdentitySource, SourceError, SpiffeId, SpiffeIdError};
use std::sync::Arc;

use crate::policy::Authorizer;

#[derive(Debug)]
struct PeerCheck {
    source: Arc<IdentitySource>,
    authorizer: Arc<Authorizer>,
    crypto_provider: Arc<CryptoProvider>,
    supported_algs: WebPkiSupportedAlgorithms,
}

impl PeerCheck {
    fn new(
        source: Arc<IdentitySource>,
        authorizer: Arc<Authorizer>,
        crypto_provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            supported_algs: crypto_provider.signature_verification_algorithms,
            source,
            authorizer,
            crypto_provider,
        }
    }

    fn peer_id(&self, end_entity: &CertificateDer<'_>) -> Result<SpiffeId, rustls::Error> {
        SpiffeId::from_certificate(end_entity.as_ref()).map_err(|e| match e {
            SpiffeIdError::BadCertificate => {
                rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
            }
            other => {
                log::warn!("Refusing peer without a usable SPIFFE ID: {}", other);
                rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
            }
        })
    }

    fn roots_for(&self, id: &SpiffeId) -> Result<RootCertStore, rustls::Error> {
        let bundle = self
            .source
            .current_bundle(id.trust_domain())
            .map_err(|e| match e {
                SourceError::UnknownTrustDomain(td) => {
                    log::warn!("Refusing {}: no trust bundle for {}", id, td);
                    rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
                }
                other => rustls::Error::General(other.to_string()),
            })?;
        let roots = bundle
            .authorities()
            .iter()
            .filter_map(|der| match webpki::anchor_from_trusted_cert(der) {
                Ok(anchor) => Some(anchor.to_owned()),
                Err(e) => {
                    log::warn!(
                        "Skipping unusable root in the {} bundle: {}",
                        bundle.trust_domain(),
                        e
                    );
                    None
                }
            })
            .collect::<Vec<_>>();
        if roots.is_empty() {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            ));
        }
        Ok(RootCertStore { roots })
    }

    fn authorize(&self, id: &SpiffeId) -> Result<(), rustls::Error> {
        if self.authorizer.evaluate(Some(id)) {
            log::debug!("Peer {} authorized", id);
            Ok(())
        } else {
            log::warn!("Refusing {}: not allowed by {}", id, self.authorizer);
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Verifies servers, for use in a [`rustls::ClientConfig`].
#[derive(Debug)]
pub struct SpiffeServerVerifier(PeerCheck);

impl SpiffeServerVerifier {
    /// Check servers against the bundles in `source` and then `authorizer`.
    pub fn new(
        source: Arc<IdentitySource>,
        authorizer: Arc<Authorizer>,
        crypto_provider: Arc<CryptoProvider>,
    ) -> Self {
        Self(PeerCheck::new(source, authorizer, crypto_provider))
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let id = self.0.peer_id(end_entity)?;
        let roots = self.0.roots_for(&id)?;
        let parsed = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &roots,
            intermediates,
            now,
            self.0.supported_algs.all,
        )?;
        self.0.authorize(&id)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

/// Verifies clients, for use in a [`rustls::ServerConfig`]. A client
/// certificate is mandatory.
#[derive(Debug)]
pub struct SpiffeClientVerifier(PeerCheck);

impl SpiffeClientVerifier {
    /// Check clients against the bundles in `source` and then `authorizer`.
    pub fn new(
        source: Arc<IdentitySource>,
        authorizer: Arc<Authorizer>,
        crypto_provider: Arc<CryptoProvider>,
    ) -> Self {
        Self(PeerCheck::new(source, authorizer, crypto_provider))
    }
}

impl ClientCertVerifier for SpiffeClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    // Clients pick their SVID without regard to our roots.
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let id = self.0.peer_id(end_entity)?;
        let roots = self.0.roots_for(&id)?;
        let verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::clone(&self.0.crypto_provider),
        )
        .build()
        .map_err(|e| {
            log::warn!("Cannot verify {} against its bundle: {}", id, e);
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
        })?;
        verifier.verify_client_cert(end_entity, intermediates, now)?;
        self.0.authorize(&id)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::pem::PemObject;
    use spiffe_demo_identity::{MemoryProvider, X509Context, testdata};
    use std::time::Duration;

    use crate::crypto_provider::crypto_provider;

    fn cert(pem: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from_pem_slice(pem).unwrap()
    }

    fn both_orgs() -> X509Context {
        testdata::context(
            testdata::SERVER_CERT,
            testdata::SERVER_KEY,
            &[
                ("example.org", testdata::EXAMPLE_ORG_BUNDLE),
                ("other.org", testdata::OTHER_ORG_BUNDLE),
            ],
        )
    }

    async fn source(context: X509Context) -> Arc<IdentitySource> {
        Arc::new(
            IdentitySource::connect(MemoryProvider::with_context(context), Duration::from_secs(3))
                .await
                .unwrap(),
        )
    }

    fn rule(s: &str) -> Arc<Authorizer> {
        Arc::new(s.parse().unwrap())
    }

    fn server_check(
        source: &Arc<IdentitySource>,
        authorizer: &str,
        presented: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let v = SpiffeServerVerifier::new(Arc::clone(source), rule(authorizer), crypto_provider());
        v.verify_server_cert(
            &cert(presented),
            &[],
            &ServerName::try_from("ignored").unwrap(),
            &[],
            now,
        )
    }

    fn client_check(
        source: &Arc<IdentitySource>,
        authorizer: &str,
        presented: &[u8],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let v = SpiffeClientVerifier::new(Arc::clone(source), rule(authorizer), crypto_provider());
        v.verify_client_cert(&cert(presented), &[], now)
    }

    fn denied<T: std::fmt::Debug>(r: Result<T, rustls::Error>) -> bool {
        matches!(
            r,
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure
            ))
        )
    }

    fn far_future() -> UnixTime {
        // 2100-01-01
        UnixTime::since_unix_epoch(Duration::from_secs(4_102_444_800))
    }

    #[tokio::test]
    async fn server_exact_identity() {
        let source = source(testdata::client_context()).await;
        let now = UnixTime::now();
        assert!(
            server_check(&source, "spiffe://example.org/server", testdata::SERVER_CERT, now)
                .is_ok()
        );
        assert!(denied(server_check(
            &source,
            "spiffe://example.org/server",
            testdata::OTHER_CERT,
            now
        )));
    }

    #[tokio::test]
    async fn client_exact_identity() {
        let source = source(testdata::server_context()).await;
        let now = UnixTime::now();
        assert!(
            client_check(&source, "spiffe://example.org/client", testdata::CLIENT_CERT, now)
                .is_ok()
        );
        assert!(denied(client_check(
            &source,
            "spiffe://example.org/other",
            testdata::CLIENT_CERT,
            now
        )));
    }

    #[tokio::test]
    async fn any_identity_still_needs_a_trusted_chain() {
        let source = source(testdata::server_context()).await;
        let now = UnixTime::now();
        assert!(client_check(&source, "*", testdata::OTHER_CERT, now).is_ok());
        assert!(matches!(
            client_check(&source, "*", testdata::FOREIGN_CERT, now),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer
            ))
        ));
    }

    #[tokio::test]
    async fn federated_trust_domain() {
        let source = source(both_orgs()).await;
        let now = UnixTime::now();
        assert!(client_check(&source, "spiffe://other.org", testdata::FOREIGN_CERT, now).is_ok());
        assert!(denied(client_check(
            &source,
            "spiffe://example.org",
            testdata::FOREIGN_CERT,
            now
        )));
        assert!(
            server_check(&source, "spiffe://other.org/workload", testdata::FOREIGN_CERT, now)
                .is_ok()
        );
    }

    #[tokio::test]
    async fn not_spiffe_is_denied() {
        let source = source(testdata::server_context()).await;
        let now = UnixTime::now();
        assert!(denied(client_check(&source, "*", testdata::NOT_SPIFFE_CERT, now)));
        assert!(denied(server_check(&source, "*", testdata::NOT_SPIFFE_CERT, now)));
    }

    #[tokio::test]
    async fn trust_domain_id_is_not_a_workload() {
        let source = source(testdata::context(
            testdata::SERVER_CERT,
            testdata::SERVER_KEY,
            &[
                ("example.org", testdata::EXAMPLE_ORG_BUNDLE),
                ("bare.org", testdata::BARE_ORG_BUNDLE),
            ],
        ))
        .await;
        let now = UnixTime::now();
        for rule in ["*", "spiffe://bare.org"] {
            assert!(denied(client_check(&source, rule, testdata::TRUST_DOMAIN_ONLY_CERT, now)));
            assert!(denied(server_check(&source, rule, testdata::TRUST_DOMAIN_ONLY_CERT, now)));
        }
    }

    #[tokio::test]
    async fn expired_is_not_an_authorization_failure() {
        let source = source(testdata::server_context()).await;
        let r = client_check(&source, "*", testdata::CLIENT_CERT, far_future());
        assert!(matches!(r, Err(rustls::Error::InvalidCertificate(_))));
        assert!(!denied(r));
        let r = server_check(&source, "*", testdata::CLIENT_CERT, far_future());
        assert!(matches!(r, Err(rustls::Error::InvalidCertificate(_))));
        assert!(!denied(r));
    }

    #[tokio::test]
    async fn closed_source_refuses_everyone() {
        let source = source(testdata::server_context()).await;
        source.close();
        assert!(client_check(&source, "*", testdata::CLIENT_CERT, UnixTime::now()).is_err());
    }
}
