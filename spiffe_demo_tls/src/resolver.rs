//! Presents the current SVID in every handshake, on either side.

use arc_swap::ArcSwapOption;
use rustls::SignatureScheme;
use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use spiffe_demo_identity::{IdentitySource, X509Svid};
use std::sync::Arc;

struct Loaded {
    svid: Arc<X509Svid>,
    key: Arc<CertifiedKey>,
}

/// Certificate resolver backed by an [`IdentitySource`].
///
/// The SVID is looked up per handshake. Loading the private key is only
/// redone when the SVID has actually rotated.
pub struct SvidResolver {
    source: Arc<IdentitySource>,
    crypto_provider: Arc<CryptoProvider>,
    loaded: ArcSwapOption<Loaded>,
}

impl SvidResolver {
    /// Resolve from `source`, loading keys with `crypto_provider`.
    pub fn new(source: Arc<IdentitySource>, crypto_provider: Arc<CryptoProvider>) -> Self {
        Self {
            source,
            crypto_provider,
            loaded: ArcSwapOption::empty(),
        }
    }

    /// The key and chain to present right now, if any.
    pub fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        let svid = match self.source.current_svid() {
            Ok(svid) => svid,
            Err(e) => {
                log::warn!("No SVID to present: {}", e);
                return None;
            }
        };
        if let Some(loaded) = self.loaded.load().as_ref() {
            if Arc::ptr_eq(&loaded.svid, &svid) {
                return Some(Arc::clone(&loaded.key));
            }
        }
        match CertifiedKey::from_der(
            svid.cert_chain().to_vec(),
            svid.private_key().clone_key(),
            &self.crypto_provider,
        ) {
            Ok(key) => {
                log::debug!("Presenting SVID for {}", svid.spiffe_id());
                let key = Arc::new(key);
                self.loaded.store(Some(Arc::new(Loaded {
                    svid,
                    key: Arc::clone(&key),
                })));
                Some(key)
            }
            Err(e) => {
                log::error!("Cannot use SVID for {}: {}", svid.spiffe_id(), e);
                None
            }
        }
    }
}

impl std::fmt::Debug for SvidResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "SvidResolver {{ {:?} }}", self.source)
    }
}

impl ResolvesServerCert for SvidResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }
}

impl ResolvesClientCert for SvidResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }

    fn has_certs(&self) -> bool {
        self.source.current_svid().is_ok()
    }
}
