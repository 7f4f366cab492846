//! The capability an identity provider must offer: fetch the current
//! material, or subscribe to it.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

use crate::bundle::{BundleError, X509BundleSet};
use crate::id::TrustDomain;
use crate::svid::{SvidError, X509Svid};

/// One update from an identity provider: the workload's SVID and the trust
/// bundles it should use to verify peers.
#[derive(Clone, Debug)]
pub struct X509Context {
    /// The workload's current SVID.
    pub svid: Arc<X509Svid>,
    /// Trust bundles, including the one for the SVID's own trust domain.
    pub bundles: Arc<X509BundleSet>,
}

impl X509Context {
    /// An update is only usable if it can verify peers in the workload's
    /// own trust domain.
    pub fn validate(&self) -> Result<(), ProviderError> {
        let td = self.svid.spiffe_id().trust_domain();
        if self.bundles.get(td).is_none() {
            return Err(ProviderError::MissingBundle(td.clone()));
        }
        Ok(())
    }
}

/// Error type returned by identity providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Wrapper for std::io::Error
    #[error("{0}")]
    IOError(#[from] std::io::Error),
    /// The provider returned an unusable SVID.
    #[error("invalid SVID: {0}")]
    Svid(#[from] SvidError),
    /// The provider returned an unusable bundle.
    #[error("invalid bundle: {0}")]
    Bundle(#[from] BundleError),
    /// The SVID's own trust domain has no bundle.
    #[error("no bundle for the SVID's trust domain {0}")]
    MissingBundle(TrustDomain),
    /// The provider cannot be reached or has gone away.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Source of X.509 identity material. The provider's wire protocol is its
/// own business; consumers only fetch or subscribe.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Fetch the current material once.
    fn fetch(&self) -> BoxFuture<'_, Result<X509Context, ProviderError>>;

    /// Subscribe to updates. The first item is the current material; each
    /// further item is a rotation. The stream ends or yields an error when
    /// the subscription is lost.
    fn watch(&self) -> BoxStream<'static, Result<X509Context, ProviderError>>;
}
