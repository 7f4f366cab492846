//! Lifecycle of one mTLS channel and the ways it can fail.

use rustls::CertificateError;
use std::io;
use thiserror::Error;

/// Where a channel is in its life.
///
/// ```text
/// Idle -> TransportConnected -> Handshaking -> Authorized -> Closed
///                 |                  |
///                 v                  v
///               Closed             Denied
/// ```
///
/// [`ChannelState::Denied`] and [`ChannelState::Closed`] are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Nothing has happened yet.
    Idle,
    /// A TCP connection exists.
    TransportConnected,
    /// TLS negotiation is under way.
    Handshaking,
    /// The handshake succeeded and the peer passed authorization.
    Authorized,
    /// The handshake failed or the peer was refused.
    Denied,
    /// The channel was shut down.
    Closed,
}

impl ChannelState {
    /// No transition leaves this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Denied | Self::Closed)
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::TransportConnected)
                | (Self::TransportConnected, Self::Handshaking)
                | (Self::TransportConnected, Self::Closed)
                | (Self::Handshaking, Self::Authorized)
                | (Self::Handshaking, Self::Denied)
                | (Self::Authorized, Self::Closed)
        )
    }

    /// Move to `next`, or refuse to.
    pub fn advance(&mut self, next: Self) -> Result<(), ChannelError> {
        if !self.can_become(next) {
            return Err(ChannelError::Transition {
                from: *self,
                to: next,
            });
        }
        log::trace!("channel {:?} -> {:?}", self, next);
        *self = next;
        Ok(())
    }
}

/// Error type for dialing and accepting mTLS channels.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Transport-level failure.
    #[error("{0}")]
    Io(#[from] io::Error),
    /// The TCP connect or TLS handshake did not finish in time.
    #[error("TLS handshake did not complete within {0}")]
    Timeout(humantime::Duration),
    /// The handshake failed, for example on an untrusted or expired
    /// certificate, or because the peer refused us.
    #[error("TLS handshake failed: {0}")]
    Handshake(rustls::Error),
    /// The peer's certificate is fine but its identity is not allowed.
    #[error("peer identity not authorized")]
    AuthorizationDenied,
    /// A state machine transition that is not allowed.
    #[error("channel cannot go from {from:?} to {to:?}")]
    Transition {
        /// Current state.
        from: ChannelState,
        /// Requested state.
        to: ChannelState,
    },
}

impl ChannelError {
    /// Sort an I/O error from the TLS layer into the right variant. rustls
    /// errors arrive wrapped in [`io::Error`].
    pub fn from_tls_io(e: io::Error) -> Self {
        match e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            Some(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            )) => Self::AuthorizationDenied,
            Some(tls) => Self::Handshake(tls.clone()),
            None => Self::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = ChannelState::Idle;
        for next in [
            ChannelState::TransportConnected,
            ChannelState::Handshaking,
            ChannelState::Authorized,
            ChannelState::Closed,
        ] {
            s.advance(next).unwrap();
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn terminal_states_stay_put() {
        for terminal in [ChannelState::Denied, ChannelState::Closed] {
            for next in [
                ChannelState::Idle,
                ChannelState::TransportConnected,
                ChannelState::Handshaking,
                ChannelState::Authorized,
                ChannelState::Denied,
                ChannelState::Closed,
            ] {
                let mut s = terminal;
                assert!(s.advance(next).is_err());
                assert_eq!(s, terminal);
            }
        }
    }

    #[test]
    fn no_skipping_the_handshake() {
        assert!(!ChannelState::Idle.can_become(ChannelState::Authorized));
        assert!(!ChannelState::TransportConnected.can_become(ChannelState::Authorized));
        assert!(!ChannelState::Authorized.can_become(ChannelState::Handshaking));
        assert!(!ChannelState::Handshaking.can_become(ChannelState::Closed));
    }

    #[test]
    fn classify_tls_errors() {
        let denied = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure),
        );
        assert!(matches!(
            ChannelError::from_tls_io(denied),
            ChannelError::AuthorizationDenied
        ));
        let untrusted = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        let e = ChannelError::from_tls_io(untrusted);
        assert!(matches!(
            e,
            ChannelError::Handshake(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer
            ))
        ));
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(matches!(
            ChannelError::from_tls_io(eof),
            ChannelError::Io(_)
        ));
    }
}
