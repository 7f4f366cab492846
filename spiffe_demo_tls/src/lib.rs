//! Mutual TLS authorized by SPIFFE identity.
//!
//! Both ends of a channel present the X.509 SVID currently held by their
//! [`IdentitySource`](spiffe_demo_identity::IdentitySource) and verify the
//! peer's chain against the bundle for the peer's own trust domain. After
//! the chain checks out, an [`Authorizer`] decides whether that particular
//! SPIFFE ID may talk to us. A rejected peer fails the handshake; no
//! application data is ever exchanged with it.
//!
//! The same [`rustls`] configurations serve two transports:
//!
//! * [`stream`]: raw TLS over TCP, one task per accepted connection.
//! * [`http`]: an [`axum`] server with the peer's identity available to
//!   handlers, and a [`reqwest`] client.
//!
//! Because the verifiers and certificate resolvers read from the identity
//! source at handshake time, a configuration built once keeps working across
//! SVID and bundle rotations. Established connections are not disturbed by a
//! rotation; only new handshakes pick up the new material.

#![warn(missing_docs)]
// Would impose a requirement for rustc 1.88
// https://github.com/rust-lang/rust/pull/132833
#![allow(clippy::collapsible_if)]

pub mod channel;
pub mod config;
pub mod http;
pub mod peer;
pub mod policy;
pub mod resolver;
pub mod stream;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod verifier;

pub use channel::{ChannelError, ChannelState};
pub use config::{ConfigError, MtlsArgs, client_config, server_config};
pub use peer::{PeerIdentityError, peer_identity, peer_identity_from_der};
pub use policy::{Authorizer, PolicyParseError};
pub use resolver::SvidResolver;
pub use stream::{MtlsListener, MtlsStream, dial};
pub use verifier::{SpiffeClientVerifier, SpiffeServerVerifier};

pub use spiffe_demo_identity::crypto_provider;
