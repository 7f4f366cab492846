//! X.509 trust bundles, one per trust domain.

use rustls_pki_types::CertificateDer;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

use crate::id::TrustDomain;

/// Error returned when loading an [`X509Bundle`].
#[derive(Debug, Error)]
pub enum BundleError {
    /// Wrapper for std::io::Error from PEM decoding.
    #[error("{0}")]
    Pem(#[from] std::io::Error),
    /// A bundle with no roots cannot verify anything.
    #[error("bundle for {0} contains no certificates")]
    Empty(TrustDomain),
}

/// The root certificates for one trust domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct X509Bundle {
    trust_domain: TrustDomain,
    authorities: Vec<CertificateDer<'static>>,
}

impl X509Bundle {
    /// Create a bundle from DER roots.
    pub fn new(
        trust_domain: TrustDomain,
        authorities: Vec<CertificateDer<'static>>,
    ) -> Result<Self, BundleError> {
        if authorities.is_empty() {
            return Err(BundleError::Empty(trust_domain));
        }
        Ok(Self {
            trust_domain,
            authorities,
        })
    }

    /// Create a bundle from PEM roots.
    pub fn from_pem(trust_domain: TrustDomain, pem: &[u8]) -> Result<Self, BundleError> {
        let authorities =
            rustls_pemfile::certs(&mut Cursor::new(pem)).collect::<Result<Vec<_>, _>>()?;
        Self::new(trust_domain, authorities)
    }

    /// The trust domain these roots are authoritative for.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Root certificates in DER form.
    pub fn authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }
}

/// At most one bundle per trust domain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct X509BundleSet(BTreeMap<TrustDomain, Arc<X509Bundle>>);

impl X509BundleSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bundle, replacing any previous one for the same trust domain.
    pub fn insert(&mut self, bundle: X509Bundle) {
        self.0
            .insert(bundle.trust_domain().clone(), Arc::new(bundle));
    }

    /// The bundle for `trust_domain`, if one is known.
    pub fn get(&self, trust_domain: &TrustDomain) -> Option<&Arc<X509Bundle>> {
        self.0.get(trust_domain)
    }

    /// All bundles, ordered by trust domain.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<X509Bundle>> {
        self.0.values()
    }

    /// Number of trust domains in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set knows no trust domains.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
