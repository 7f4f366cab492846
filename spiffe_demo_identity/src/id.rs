//! SPIFFE IDs and trust domains.
//!
//! A SPIFFE ID has the form `spiffe://trust-domain/path`. The trust domain
//! is a lowercase DNS-like name and the path is a sequence of non-empty
//! segments. Both are validated on parse so that everything else in the
//! workspace can compare identities by value.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

const SCHEME: &str = "spiffe";

/// Error returned when parsing or extracting a SPIFFE ID.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SpiffeIdError {
    /// Nothing to parse.
    #[error("SPIFFE ID is empty")]
    Empty,
    /// The scheme is missing or is something other than `spiffe`.
    #[error("scheme is missing or is not \"spiffe\"")]
    WrongScheme,
    /// Nothing between `spiffe://` and the path.
    #[error("trust domain is missing")]
    MissingTrustDomain,
    /// Uppercase letters, ports, userinfo and the like all end up here.
    #[error("trust domain contains an invalid character")]
    BadTrustDomainChar,
    /// A `//` inside the path.
    #[error("path contains an empty segment")]
    EmptySegment,
    /// `.` and `..` are not allowed as path segments.
    #[error("path contains a dot segment")]
    DotSegment,
    /// Query strings and fragments end up here.
    #[error("path contains an invalid character")]
    BadPathChar,
    /// The path ends with `/`.
    #[error("path cannot have a trailing slash")]
    TrailingSlash,
    /// The certificate was not valid DER.
    #[error("certificate could not be parsed")]
    BadCertificate,
    /// The certificate has no URI subject alternative name.
    #[error("certificate does not contain a SPIFFE ID")]
    NoUriSan,
    /// An SVID carries exactly one URI SAN.
    #[error("certificate contains {0} URI SANs, expected exactly one")]
    MultipleUriSans(usize),
    /// A certificate names a whole trust domain rather than a workload.
    #[error("certificate SPIFFE ID has no path")]
    MissingPath,
}

/// An administrative namespace sharing one root of trust.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrustDomain(String);

fn is_trust_domain_char(c: u8) -> bool {
    matches!(c, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_')
}

fn is_path_segment_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'.' | b'-' | b'_')
}

impl TrustDomain {
    /// Validate a bare trust domain name such as `example.org`.
    pub fn new(name: &str) -> Result<Self, SpiffeIdError> {
        if name.is_empty() {
            return Err(SpiffeIdError::MissingTrustDomain);
        }
        if !name.bytes().all(is_trust_domain_char) {
            return Err(SpiffeIdError::BadTrustDomainChar);
        }
        Ok(Self(name.to_owned()))
    }

    /// The trust domain name, without scheme.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The SPIFFE ID of the trust domain itself, e.g. `spiffe://example.org`.
    pub fn id_string(&self) -> String {
        format!("{}://{}", SCHEME, self.0)
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts either `example.org` or `spiffe://example.org`.
impl FromStr for TrustDomain {
    type Err = SpiffeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains("://") {
            let id = s.parse::<SpiffeId>()?;
            if !id.path.is_empty() {
                return Err(SpiffeIdError::BadTrustDomainChar);
            }
            Ok(id.trust_domain)
        } else {
            Self::new(s)
        }
    }
}

/// Identifies exactly one workload.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

fn validate_path(path: &str) -> Result<(), SpiffeIdError> {
    if path.is_empty() {
        return Ok(());
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(SpiffeIdError::BadPathChar);
    };
    let mut segments = rest.split('/').peekable();
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return Err(if segments.peek().is_none() {
                SpiffeIdError::TrailingSlash
            } else {
                SpiffeIdError::EmptySegment
            });
        }
        if segment == "." || segment == ".." {
            return Err(SpiffeIdError::DotSegment);
        }
        if !segment.bytes().all(is_path_segment_char) {
            return Err(SpiffeIdError::BadPathChar);
        }
    }
    Ok(())
}

impl SpiffeId {
    /// Build an ID from a trust domain and a path, which is either empty or
    /// starts with `/`.
    pub fn new(trust_domain: TrustDomain, path: &str) -> Result<Self, SpiffeIdError> {
        validate_path(path)?;
        Ok(Self {
            trust_domain,
            path: path.to_owned(),
        })
    }

    /// The trust domain this identity belongs to.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The path component, including its leading `/`. Empty for the ID of
    /// a trust domain itself.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Extract the SPIFFE ID from a DER certificate.
    pub fn from_certificate(der: &[u8]) -> Result<Self, SpiffeIdError> {
        let (_, cert) =
            X509Certificate::from_der(der).or(Err(SpiffeIdError::BadCertificate))?;
        Self::from_x509(&cert)
    }

    /// Extract the SPIFFE ID from a parsed certificate. The certificate must
    /// carry exactly one URI SAN and it must be the SPIFFE ID of a workload,
    /// not of a bare trust domain.
    pub fn from_x509(cert: &X509Certificate<'_>) -> Result<Self, SpiffeIdError> {
        let san = cert
            .subject_alternative_name()
            .or(Err(SpiffeIdError::BadCertificate))?;
        let uris = san
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|gn| match gn {
                        GeneralName::URI(uri) => Some(*uri),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let id: Self = match uris.as_slice() {
            [] => return Err(SpiffeIdError::NoUriSan),
            [uri] => uri.parse()?,
            many => return Err(SpiffeIdError::MultipleUriSans(many.len())),
        };
        if id.path.is_empty() {
            return Err(SpiffeIdError::MissingPath);
        }
        Ok(id)
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", SCHEME, self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = SpiffeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SpiffeIdError::Empty);
        }
        let (scheme, rest) = s.split_once("://").ok_or(SpiffeIdError::WrongScheme)?;
        if !scheme.eq_ignore_ascii_case(SCHEME) {
            return Err(SpiffeIdError::WrongScheme);
        }
        let (td, path) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };
        Self::new(TrustDomain::new(td)?, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata;

    fn leaf_der(pem: &[u8]) -> Vec<u8> {
        rustls_pemfile::certs(&mut std::io::Cursor::new(pem))
            .next()
            .expect("one cert")
            .expect("valid pem")
            .to_vec()
    }

    #[test]
    fn parse_and_display() {
        let id: SpiffeId = "spiffe://example.org/ns/prod/sa/client".parse().unwrap();
        assert_eq!(id.trust_domain().as_str(), "example.org");
        assert_eq!(id.path(), "/ns/prod/sa/client");
        assert_eq!(id.to_string(), "spiffe://example.org/ns/prod/sa/client");
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let id: SpiffeId = "SPIFFE://example.org/client".parse().unwrap();
        assert_eq!(id.to_string(), "spiffe://example.org/client");
    }

    #[test]
    fn trust_domain_only() {
        let id: SpiffeId = "spiffe://example.org".parse().unwrap();
        assert_eq!(id.path(), "");
        assert_eq!(id.trust_domain().id_string(), "spiffe://example.org");
    }

    #[test]
    fn rejects_malformed() {
        let cases = [
            ("", SpiffeIdError::Empty),
            ("example.org/client", SpiffeIdError::WrongScheme),
            ("https://example.org/client", SpiffeIdError::WrongScheme),
            ("spiffe:///client", SpiffeIdError::MissingTrustDomain),
            ("spiffe://Example.org/client", SpiffeIdError::BadTrustDomainChar),
            ("spiffe://example.org:8080/client", SpiffeIdError::BadTrustDomainChar),
            ("spiffe://user@example.org/client", SpiffeIdError::BadTrustDomainChar),
            ("spiffe://example.org/a//b", SpiffeIdError::EmptySegment),
            ("spiffe://example.org/a/../b", SpiffeIdError::DotSegment),
            ("spiffe://example.org/client?x=1", SpiffeIdError::BadPathChar),
            ("spiffe://example.org/client#frag", SpiffeIdError::BadPathChar),
            ("spiffe://example.org/client/", SpiffeIdError::TrailingSlash),
        ];
        for (input, want) in cases {
            assert_eq!(input.parse::<SpiffeId>(), Err(want), "{}", input);
        }
    }

    #[test]
    fn trust_domain_parse_forms() {
        let a: TrustDomain = "example.org".parse().unwrap();
        let b: TrustDomain = "spiffe://example.org".parse().unwrap();
        assert_eq!(a, b);
        assert!("spiffe://example.org/client".parse::<TrustDomain>().is_err());
    }

    #[test]
    fn equality_is_by_value() {
        let a: SpiffeId = "spiffe://example.org/client".parse().unwrap();
        let b = SpiffeId::new(TrustDomain::new("example.org").unwrap(), "/client").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, "spiffe://other.org/client".parse().unwrap());
    }

    #[test]
    fn from_svid_certificate() {
        let id = SpiffeId::from_certificate(&leaf_der(testdata::CLIENT_CERT)).unwrap();
        assert_eq!(id.to_string(), "spiffe://example.org/client");
    }

    #[test]
    fn from_certificate_without_uri_san() {
        assert_eq!(
            SpiffeId::from_certificate(&leaf_der(testdata::NOT_SPIFFE_CERT)),
            Err(SpiffeIdError::NoUriSan)
        );
    }

    #[test]
    fn from_certificate_naming_only_a_trust_domain() {
        assert_eq!(
            SpiffeId::from_certificate(&leaf_der(testdata::TRUST_DOMAIN_ONLY_CERT)),
            Err(SpiffeIdError::MissingPath)
        );
        // The same string is fine anywhere but in a certificate.
        assert!("spiffe://bare.org".parse::<SpiffeId>().is_ok());
    }

    #[test]
    fn from_garbage() {
        assert_eq!(
            SpiffeId::from_certificate(b"not a certificate"),
            Err(SpiffeIdError::BadCertificate)
        );
    }
}
