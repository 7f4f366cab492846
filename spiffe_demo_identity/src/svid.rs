//! X.509 SVIDs: the certificate chain and key proving a workload's identity.

use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::io::Cursor;
use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::crypto_provider::crypto_provider;
use crate::id::{SpiffeId, SpiffeIdError};

/// Error returned when assembling an [`X509Svid`].
#[derive(Debug, Error)]
pub enum SvidError {
    /// Wrapper for std::io::Error from PEM decoding.
    #[error("{0}")]
    Pem(#[from] std::io::Error),
    /// The chain has no leaf.
    #[error("SVID contains no certificates")]
    EmptyChain,
    /// The key material is missing.
    #[error("no private key found")]
    NoPrivateKey,
    /// The leaf certificate is not valid DER.
    #[error("SVID leaf certificate could not be parsed")]
    BadCertificate,
    /// A CA certificate cannot be used as an SVID.
    #[error("SVID leaf certificate is a CA certificate")]
    LeafIsCa,
    /// The leaf does not carry a usable SPIFFE ID.
    #[error("{0}")]
    SpiffeId(#[from] SpiffeIdError),
    /// The private key belongs to some other certificate.
    #[error("private key does not match the SVID certificate")]
    KeyMismatch,
    /// The private key could not be loaded for signing.
    #[error("unusable SVID private key: {0}")]
    UnusableKey(rustls::Error),
}

/// An X.509 SVID. The leaf certificate is first in the chain and the
/// validity window is taken from it.
#[derive(Debug)]
pub struct X509Svid {
    spiffe_id: SpiffeId,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl X509Svid {
    /// Assemble an SVID from a DER certificate chain (leaf first) and its
    /// private key.
    pub fn from_der(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, SvidError> {
        let leaf = cert_chain.first().ok_or(SvidError::EmptyChain)?;
        let (_, parsed) =
            X509Certificate::from_der(leaf.as_ref()).or(Err(SvidError::BadCertificate))?;
        if parsed.is_ca() {
            return Err(SvidError::LeafIsCa);
        }
        let spiffe_id = SpiffeId::from_x509(&parsed)?;
        let validity = parsed.validity();
        let not_before = validity.not_before.to_datetime();
        let not_after = validity.not_after.to_datetime();
        // A cert and key read half way through a rotation must never be
        // served together.
        let provider = crypto_provider();
        match CertifiedKey::from_der(cert_chain.clone(), private_key.clone_key(), &provider) {
            Ok(_) => (),
            Err(rustls::Error::InconsistentKeys(_)) => return Err(SvidError::KeyMismatch),
            Err(e) => return Err(SvidError::UnusableKey(e)),
        }
        Ok(Self {
            spiffe_id,
            cert_chain,
            private_key,
            not_before,
            not_after,
        })
    }

    /// Assemble an SVID from PEM-encoded certificates and a PEM-encoded key.
    pub fn from_pem(certs: &[u8], key: &[u8]) -> Result<Self, SvidError> {
        let cert_chain =
            rustls_pemfile::certs(&mut Cursor::new(certs)).collect::<Result<Vec<_>, _>>()?;
        let private_key =
            rustls_pemfile::private_key(&mut Cursor::new(key))?.ok_or(SvidError::NoPrivateKey)?;
        Self::from_der(cert_chain, private_key)
    }

    /// The identity this SVID proves.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Leaf first, then any intermediates.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        // from_der refuses an empty chain.
        &self.cert_chain[0]
    }

    /// The private key matching the leaf certificate.
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    /// Start of the leaf certificate's validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the leaf certificate's validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Time left before the leaf expires, measured from `now`. Negative once
    /// expired.
    pub fn time_to_expiry(&self, now: OffsetDateTime) -> time::Duration {
        self.not_after - now
    }

    /// Whether this SVID carries the same material as another.
    pub fn same_material(&self, other: &Self) -> bool {
        self.cert_chain == other.cert_chain
            && self.private_key.secret_der() == other.private_key.secret_der()
    }
}
