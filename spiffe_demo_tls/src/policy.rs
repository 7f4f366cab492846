//! Which peers a channel accepts.
//!
//! An [`Authorizer`] is consulted once per handshake, after the peer's
//! certificate chain has been verified. It only ever sees the peer's SPIFFE
//! ID, and a peer without one is always refused.
//!
//! On the command line a rule is written as:
//!
//! | Text | Rule |
//! |------|------|
//! | `spiffe://example.org/client` | [`Authorizer::ExactIdentity`] |
//! | `spiffe://example.org/a,spiffe://example.org/b` | [`Authorizer::OneOf`] |
//! | `spiffe://example.org` | [`Authorizer::TrustDomainMatch`] |
//! | `*` | [`Authorizer::AnyIdentity`] |

use spiffe_demo_identity::{SpiffeId, SpiffeIdError, TrustDomain};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned by [`Authorizer::from_str`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyParseError {
    /// Nothing to parse.
    #[error("authorization rule is empty")]
    Empty,
    /// One of the listed identities is not a SPIFFE ID.
    #[error("{value:?} is not a SPIFFE ID: {source}")]
    BadId {
        /// The offending text.
        value: String,
        /// Why it did not parse.
        #[source]
        source: SpiffeIdError,
    },
    /// A list of identities may not contain a bare trust domain.
    #[error("{0} names a whole trust domain and cannot be part of a list")]
    TrustDomainInList(String),
}

/// An authorization rule bound to one side of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Authorizer {
    /// Only this exact identity.
    ExactIdentity(SpiffeId),
    /// Any of these identities.
    OneOf(Vec<SpiffeId>),
    /// Anyone holding a SPIFFE ID that chains to a known bundle.
    AnyIdentity,
    /// Any workload in this trust domain.
    TrustDomainMatch(TrustDomain),
}

impl Authorizer {
    /// Decide whether `peer` may use the channel. `None` stands for a peer
    /// whose certificate carries no usable SPIFFE ID.
    pub fn evaluate(&self, peer: Option<&SpiffeId>) -> bool {
        let Some(peer) = peer else {
            return false;
        };
        match self {
            Self::ExactIdentity(want) => want == peer,
            Self::OneOf(allowed) => allowed.contains(peer),
            Self::AnyIdentity => true,
            Self::TrustDomainMatch(td) => peer.trust_domain() == td,
        }
    }
}

fn parse_id(value: &str) -> Result<SpiffeId, PolicyParseError> {
    value.parse().map_err(|source| PolicyParseError::BadId {
        value: value.to_owned(),
        source,
    })
}

impl FromStr for Authorizer {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PolicyParseError::Empty);
        }
        if s == "*" {
            return Ok(Self::AnyIdentity);
        }
        if !s.contains(',') {
            let id = parse_id(s)?;
            return Ok(if id.path().is_empty() {
                Self::TrustDomainMatch(id.trust_domain().clone())
            } else {
                Self::ExactIdentity(id)
            });
        }
        let ids = s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                let id = parse_id(item)?;
                if id.path().is_empty() {
                    return Err(PolicyParseError::TrustDomainInList(item.to_owned()));
                }
                Ok(id)
            })
            .collect::<Result<Vec<_>, _>>()?;
        match ids.len() {
            0 => Err(PolicyParseError::Empty),
            1 => Ok(Self::ExactIdentity(ids.into_iter().next().ok_or(PolicyParseError::Empty)?)),
            _ => Ok(Self::OneOf(ids)),
        }
    }
}

impl fmt::Display for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExactIdentity(id) => write!(f, "{}", id),
            Self::OneOf(ids) => {
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", id)?;
                }
                Ok(())
            }
            Self::AnyIdentity => f.write_str("*"),
            Self::TrustDomainMatch(td) => f.write_str(&td.id_string()),
        }
    }
}
