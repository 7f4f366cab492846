//! Human-readable summaries of certificates, for logs and debug pages.

use std::fmt;
use std::fmt::Write as _;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::objects::{oid_registry, oid2sn};
use x509_parser::oid_registry::Oid;
use x509_parser::prelude::FromDer;

use crate::svid::SvidError;

/// The interesting fields of one certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateDetails {
    /// Issuer distinguished name.
    pub issuer: String,
    /// Subject distinguished name.
    pub subject: String,
    /// Start of the validity window.
    pub not_before: OffsetDateTime,
    /// End of the validity window.
    pub not_after: OffsetDateTime,
    /// Colon-separated hex.
    pub serial_number: String,
    /// Short name of the signature algorithm, or its dotted OID if unknown.
    pub signature_algorithm: String,
    /// Short name of the subject key algorithm, or its dotted OID if unknown.
    pub public_key_algorithm: String,
    /// X.509 version, counting from 1.
    pub version: u32,
    /// URI subject alternative names. An SVID has exactly one.
    pub uris: Vec<String>,
    /// DNS subject alternative names.
    pub dns_names: Vec<String>,
    /// One line per extension: name, criticality and hex value.
    pub extensions: Vec<String>,
}

fn oid_name(oid: &Oid<'_>) -> String {
    oid2sn(oid, oid_registry())
        .map(String::from)
        .unwrap_or_else(|_| oid.to_id_string())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

impl CertificateDetails {
    /// Summarise a DER certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, SvidError> {
        let (_, cert) = X509Certificate::from_der(der).or(Err(SvidError::BadCertificate))?;
        let mut uris = Vec::new();
        let mut dns_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for gn in &san.value.general_names {
                match gn {
                    GeneralName::URI(u) => uris.push(u.to_string()),
                    GeneralName::DNSName(d) => dns_names.push(d.to_string()),
                    _ => (),
                }
            }
        }
        let extensions = cert
            .extensions()
            .iter()
            .map(|ext| {
                format!(
                    "ID: {}, Critical: {}, Value: {}",
                    oid_name(&ext.oid),
                    ext.critical,
                    hex(ext.value)
                )
            })
            .collect();
        Ok(Self {
            issuer: cert.issuer().to_string(),
            subject: cert.subject().to_string(),
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
            serial_number: cert.raw_serial_as_string(),
            signature_algorithm: oid_name(&cert.signature_algorithm.algorithm),
            public_key_algorithm: oid_name(&cert.public_key().algorithm.algorithm),
            // X509Version is zero-based.
            version: cert.version().0 + 1,
            uris,
            dns_names,
            extensions,
        })
    }
}

impl fmt::Display for CertificateDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Issuer: {}", self.issuer)?;
        writeln!(f, "Subject: {}", self.subject)?;
        writeln!(f, "Not Before: {}", self.not_before)?;
        writeln!(f, "Not After: {}", self.not_after)?;
        writeln!(f, "Serial Number: {}", self.serial_number)?;
        writeln!(f, "Signature Algorithm: {}", self.signature_algorithm)?;
        writeln!(f, "Public Key Algorithm: {}", self.public_key_algorithm)?;
        writeln!(f, "Version: {}", self.version)?;
        for uri in &self.uris {
            writeln!(f, "URI: {}", uri)?;
        }
        for dns in &self.dns_names {
            writeln!(f, "DNS Name: {}", dns)?;
        }
        for ext in &self.extensions {
            writeln!(f, "Extension: {}", ext)?;
        }
        Ok(())
    }
}
