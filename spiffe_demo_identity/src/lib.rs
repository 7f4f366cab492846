//! SPIFFE workload identity for the demo services.
//!
//! An [`IdentitySource`] is connected to some [`IdentityProvider`] (usually a
//! [`DirectoryProvider`] reading PEM files that a SPIFFE agent sidecar keeps
//! fresh) and from then on always holds the workload's current
//! [`X509Svid`] plus the [`X509Bundle`] for every trust domain it knows.
//! The TLS crate reads from it at handshake time; long-running tasks can
//! [`IdentitySource::subscribe`] to be told about rotations.
//!
//! There is no global state: construct a source with
//! [`IdentitySource::connect`], share it with [`std::sync::Arc`], and
//! [`IdentitySource::close`] it (or drop it) when done.

#![warn(missing_docs)]
// Would impose a requirement for rustc 1.88
// https://github.com/rust-lang/rust/pull/132833
#![allow(clippy::collapsible_if)]

pub mod bundle;
pub mod crypto_provider;
pub mod details;
pub mod files;
pub mod id;
pub mod memory;
pub mod provider;
pub mod source;
pub mod svid;
#[cfg(any(test, feature = "testdata"))]
pub mod testdata;
pub mod watch;

pub use bundle::{X509Bundle, X509BundleSet};
pub use details::CertificateDetails;
pub use files::DirectoryProvider;
pub use id::{SpiffeId, SpiffeIdError, TrustDomain};
pub use memory::MemoryProvider;
pub use provider::{IdentityProvider, ProviderError, X509Context};
pub use source::{IdentitySource, SourceError};
pub use svid::{SvidError, X509Svid};
pub use watch::{Subscription, WatchError, WatchKind, WatchUpdate, Watcher};
