//! Who is on the other end of a finished handshake.

use rustls::CommonState;
use spiffe_demo_identity::{SpiffeId, SpiffeIdError};
use thiserror::Error;

/// Error returned by [`peer_identity`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PeerIdentityError {
    /// The session carries no peer certificate chain.
    #[error("peer presented no certificate")]
    NoPeerCertificate,
    /// The leaf certificate has no usable SPIFFE ID.
    #[error("peer certificate has no valid SPIFFE ID: {0}")]
    Malformed(#[from] SpiffeIdError),
}

/// The SPIFFE ID from the leaf of the peer's certificate chain.
pub fn peer_identity(session: &CommonState) -> Result<SpiffeId, PeerIdentityError> {
    let leaf = session
        .peer_certificates()
        .and_then(|chain| chain.first())
        .ok_or(PeerIdentityError::NoPeerCertificate)?;
    peer_identity_from_der(leaf.as_ref())
}

/// The SPIFFE ID in a DER leaf certificate, for callers such as HTTP
/// clients that only get to see the leaf.
pub fn peer_identity_from_der(der: &[u8]) -> Result<SpiffeId, PeerIdentityError> {
    Ok(SpiffeId::from_certificate(der)?)
}
