//! The process-global default [`CryptoProvider`] if there is one, otherwise
//! aws-lc-rs.

use rustls::crypto::CryptoProvider;
use std::sync::Arc;

/// Return the [`CryptoProvider`] used to load SVID keys and to build every
/// TLS configuration.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}
