//! Client certificate parsing.
//!
//! Accepts a PEM or DER encoded X.509 certificate and extracts what the
//! binding checks need: names, validity window, key algorithm, SANs, key
//! usage and the SHA-1/SHA-256 thumbprints over the DER bytes.
//!
//! Validity problems are reported alongside the parsed info rather than
//! thrown, so the caller decides whether an expired certificate is fatal.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};
use x509_parser::public_key::PublicKey;
use x509_parser::time::ASN1Time;

use crate::clock::{Clock, SystemClock};
use crate::error::AuthError;

// =============================================================================
// Errors
// =============================================================================

/// Certificate parsing, validity and retrieval errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertificateError {
    /// The input is not a parseable X.509 certificate.
    #[error("Malformed certificate: {0}")]
    Malformed(String),

    /// The certificate's `notAfter` has passed.
    #[error("Certificate expired at {not_after}")]
    Expired {
        /// End of the validity window.
        not_after: OffsetDateTime,
    },

    /// The certificate's `notBefore` is in the future.
    #[error("Certificate not valid before {not_before}")]
    NotYetValid {
        /// Start of the validity window.
        not_before: OffsetDateTime,
    },

    /// Remote retrieval did not finish in time.
    #[error("Certificate fetch from {url} timed out")]
    Timeout {
        /// The URL being fetched.
        url: String,
    },

    /// Remote retrieval failed.
    #[error("Certificate fetch failed: {0}")]
    Fetch(String),
}

impl CertificateError {
    /// Returns `true` for validity-window errors.
    #[must_use]
    pub fn is_validity_error(&self) -> bool {
        matches!(self, Self::Expired { .. } | Self::NotYetValid { .. })
    }
}

impl From<CertificateError> for AuthError {
    fn from(err: CertificateError) -> Self {
        match err {
            CertificateError::Timeout { url } => {
                AuthError::timeout(format!("certificate fetch from {url}"))
            }
            CertificateError::Fetch(message) => AuthError::storage(message),
            other => AuthError::invalid_client(other.to_string()),
        }
    }
}

// =============================================================================
// Certificate Info
// =============================================================================

/// A Subject Alternative Name entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Dns(String),
    Uri(String),
    Email(String),
    Ip(IpAddr),
}

impl fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns(name) => write!(f, "DNS:{name}"),
            Self::Uri(uri) => write!(f, "URI:{uri}"),
            Self::Email(email) => write!(f, "email:{email}"),
            Self::Ip(ip) => write!(f, "IP:{ip}"),
        }
    }
}

/// Parsed facts about a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject DN in RFC 2253 form.
    pub subject_dn: String,
    /// Issuer DN in RFC 2253 form.
    pub issuer_dn: String,
    /// Serial number, lowercase hex.
    pub serial: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    /// "RSA", "EC", "Ed25519" or the algorithm OID.
    pub public_key_algorithm: String,
    /// Key size in bits, when known.
    pub public_key_bits: Option<usize>,
    pub subject_alt_names: Vec<SubjectAltName>,
    /// Names of the asserted key usage bits.
    pub key_usage: Vec<String>,
    /// Base64url SHA-256 over the DER encoding.
    pub thumbprint_sha256: String,
    /// Base64url SHA-1 over the DER encoding.
    pub thumbprint_sha1: String,
    /// The DER encoding.
    pub der: Vec<u8>,
}

impl CertificateInfo {
    /// Returns `true` if `now` falls inside the validity window.
    #[must_use]
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Returns the DNS names among the SANs.
    pub fn dns_names(&self) -> impl Iterator<Item = &str> {
        self.subject_alt_names.iter().filter_map(|san| match san {
            SubjectAltName::Dns(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Result of parsing a certificate.
///
/// `info` is `None` only when the input is malformed.
#[derive(Debug, Clone)]
pub struct CertificateParse {
    pub info: Option<CertificateInfo>,
    pub errors: Vec<CertificateError>,
}

impl CertificateParse {
    /// Returns `true` if the certificate parsed without errors.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.info.is_some() && self.errors.is_empty()
    }

    /// Converts into the info, or the first error.
    ///
    /// # Errors
    ///
    /// Returns the first reported error.
    pub fn into_result(self) -> Result<CertificateInfo, CertificateError> {
        match (self.info, self.errors.into_iter().next()) {
            (_, Some(error)) => Err(error),
            (Some(info), None) => Ok(info),
            (None, None) => Err(CertificateError::Malformed("empty input".into())),
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Parses presented client certificates.
#[derive(Debug, Clone)]
pub struct CertificateValidator {
    clock: Arc<dyn Clock>,
}

impl Default for CertificateValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateValidator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Parses a PEM or DER certificate and checks its validity window.
    #[must_use]
    pub fn parse(&self, input: &[u8]) -> CertificateParse {
        let info = match extract(input) {
            Ok(info) => info,
            Err(error) => {
                return CertificateParse {
                    info: None,
                    errors: vec![error],
                };
            }
        };

        let now = self.clock.now();
        let mut errors = Vec::new();
        if now > info.not_after {
            errors.push(CertificateError::Expired {
                not_after: info.not_after,
            });
        }
        if now < info.not_before {
            errors.push(CertificateError::NotYetValid {
                not_before: info.not_before,
            });
        }

        CertificateParse {
            info: Some(info),
            errors,
        }
    }
}

fn extract(input: &[u8]) -> Result<CertificateInfo, CertificateError> {
    let der = if input.trim_ascii_start().starts_with(b"-----BEGIN") {
        let (_, pem) = parse_x509_pem(input.trim_ascii_start())
            .map_err(|e| CertificateError::Malformed(format!("invalid PEM: {e}")))?;
        if pem.label != "CERTIFICATE" {
            return Err(CertificateError::Malformed(format!(
                "unexpected PEM label {}",
                pem.label
            )));
        }
        pem.contents
    } else {
        input.to_vec()
    };

    let (rest, cert) = X509Certificate::from_der(&der)
        .map_err(|e| CertificateError::Malformed(e.to_string()))?;
    let certificate_der = &der[..der.len() - rest.len()];

    let (public_key_algorithm, public_key_bits) = match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => ("RSA".to_string(), Some(rsa.key_size())),
        Ok(PublicKey::EC(point)) => ("EC".to_string(), Some(point.key_size())),
        _ => {
            let oid = cert.public_key().algorithm.algorithm.to_id_string();
            match oid.as_str() {
                "1.3.101.112" => ("Ed25519".to_string(), Some(256)),
                "1.3.101.113" => ("Ed448".to_string(), Some(456)),
                _ => (oid, None),
            }
        }
    };

    let subject_alt_names = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(SubjectAltName::Dns((*dns).to_string())),
                GeneralName::URI(uri) => Some(SubjectAltName::Uri((*uri).to_string())),
                GeneralName::RFC822Name(email) => Some(SubjectAltName::Email((*email).to_string())),
                GeneralName::IPAddress(bytes) => ip_from_bytes(bytes).map(SubjectAltName::Ip),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => return Err(CertificateError::Malformed(format!("invalid SAN: {e}"))),
    };

    let key_usage = match cert.key_usage() {
        Ok(Some(ext)) => {
            let ku = ext.value;
            [
                (ku.digital_signature(), "digitalSignature"),
                (ku.non_repudiation(), "nonRepudiation"),
                (ku.key_encipherment(), "keyEncipherment"),
                (ku.data_encipherment(), "dataEncipherment"),
                (ku.key_agreement(), "keyAgreement"),
                (ku.key_cert_sign(), "keyCertSign"),
                (ku.crl_sign(), "cRLSign"),
                (ku.encipher_only(), "encipherOnly"),
                (ku.decipher_only(), "decipherOnly"),
            ]
            .into_iter()
            .filter_map(|(set, name)| set.then(|| name.to_string()))
            .collect()
        }
        Ok(None) => Vec::new(),
        Err(e) => return Err(CertificateError::Malformed(format!("invalid key usage: {e}"))),
    };

    let validity = cert.validity();
    Ok(CertificateInfo {
        subject_dn: rfc2253(cert.subject()),
        issuer_dn: rfc2253(cert.issuer()),
        serial: hex::encode(cert.raw_serial()),
        not_before: to_datetime(validity.not_before)?,
        not_after: to_datetime(validity.not_after)?,
        public_key_algorithm,
        public_key_bits,
        subject_alt_names,
        key_usage,
        thumbprint_sha256: URL_SAFE_NO_PAD.encode(Sha256::digest(certificate_der)),
        thumbprint_sha1: URL_SAFE_NO_PAD.encode(Sha1::digest(certificate_der)),
        der: certificate_der.to_vec(),
    })
}

fn to_datetime(time: ASN1Time) -> Result<OffsetDateTime, CertificateError> {
    OffsetDateTime::from_unix_timestamp(time.timestamp())
        .map_err(|e| CertificateError::Malformed(format!("validity out of range: {e}")))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

// =============================================================================
// Distinguished Names
// =============================================================================

fn attribute_name(oid: &str) -> Option<&'static str> {
    Some(match oid {
        "2.5.4.3" => "CN",
        "2.5.4.6" => "C",
        "2.5.4.7" => "L",
        "2.5.4.8" => "ST",
        "2.5.4.9" => "STREET",
        "2.5.4.10" => "O",
        "2.5.4.11" => "OU",
        "0.9.2342.19200300.100.1.1" => "UID",
        "0.9.2342.19200300.100.1.25" => "DC",
        _ => return None,
    })
}

/// Formats a name per RFC 2253: most specific RDN first.
fn rfc2253(name: &X509Name<'_>) -> String {
    let rdns: Vec<String> = name
        .iter_rdn()
        .map(|rdn| {
            rdn.iter()
                .map(|atv| {
                    let oid = atv.attr_type().to_id_string();
                    let key = attribute_name(&oid).map_or(oid, str::to_string);
                    let value = match atv.as_str() {
                        Ok(value) => escape_dn_value(value),
                        Err(_) => format!("#{}", hex::encode(atv.attr_value().data)),
                    };
                    format!("{key}={value}")
                })
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect();
    rdns.into_iter().rev().collect::<Vec<_>>().join(",")
}

fn escape_dn_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let needs_escape = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';')
            || (i == 0 && (c == '#' || c == ' '))
            || (i == last && c == ' ');
        if needs_escape {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Normalizes a distinguished name for comparison.
///
/// Accepts RFC 2253 (`CN=a,O=b,C=US`, spaces after commas allowed) and the
/// OpenSSL slash form (`/C=US/O=b/CN=a`, least specific first). Attribute
/// names are upper-cased, values trimmed, whitespace collapsed and
/// lower-cased, and the result is in RFC 2253 order.
#[must_use]
pub fn normalize_dn(dn: &str) -> String {
    let dn = dn.trim();
    let mut components: Vec<String> = if let Some(rest) = dn.strip_prefix('/') {
        split_unescaped(rest, '/')
    } else {
        split_unescaped(dn, ',')
    };
    if dn.starts_with('/') {
        components.reverse();
    }

    components
        .iter()
        .filter(|c| !c.trim().is_empty())
        .map(|component| {
            split_unescaped(component, '+')
                .iter()
                .map(|atv| match atv.split_once('=') {
                    Some((key, value)) => format!(
                        "{}={}",
                        key.trim().to_ascii_uppercase(),
                        value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
                    ),
                    None => atv.trim().to_lowercase(),
                })
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn split_unescaped(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            current.push(c);
            escaped = true;
        } else if c == separator {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    pub(crate) const CLIENT_A: &str = include_str!("testdata/client_a.pem");
    pub(crate) const CLIENT_B: &str = include_str!("testdata/client_b.pem");
    pub(crate) const CLIENT_EXPIRED: &str = include_str!("testdata/client_expired.pem");
    pub(crate) const CLIENT_FUTURE: &str = include_str!("testdata/client_future.pem");

    pub(crate) const CLIENT_A_S256: &str = "UTZH0FGzmNRCRwZ0Fg1Ptaljzxe5e7_jhBr3TXb3z-0";
    pub(crate) const CLIENT_A_SHA1: &str = "xZHHV0DvgfWv_aRfpkBvOr-99iA";
    pub(crate) const CLIENT_B_S256: &str = "lawb603wkbYBWeJVtrs8rwiaIANdDiK3Nlt870G1Yfk";

    pub(crate) fn validator() -> CertificateValidator {
        CertificateValidator::new()
            .with_clock(Arc::new(ManualClock::new(datetime!(2030-06-01 0:00 UTC))))
    }

    #[test]
    fn test_parse_ec_certificate() {
        let parse = validator().parse(CLIENT_A.as_bytes());
        assert!(parse.is_valid(), "{:?}", parse.errors);
        let info = parse.into_result().unwrap();

        assert_eq!(info.subject_dn, "CN=client-a,O=Tessera Test,C=US");
        assert_eq!(info.issuer_dn, "CN=Tessera Test CA,O=Tessera Test,C=US");
        assert_eq!(info.serial, "4c7d02951113b3ac5e4893ed5adfb96c88f48ae0");
        assert_eq!(info.not_before, datetime!(2024-01-01 0:00 UTC));
        assert_eq!(info.not_after, datetime!(2124-01-01 0:00 UTC));
        assert_eq!(info.public_key_algorithm, "EC");
        assert_eq!(info.public_key_bits, Some(256));
        assert_eq!(info.thumbprint_sha256, CLIENT_A_S256);
        assert_eq!(info.thumbprint_sha1, CLIENT_A_SHA1);
        assert_eq!(info.key_usage, vec!["digitalSignature", "keyEncipherment"]);
        assert_eq!(info.dns_names().collect::<Vec<_>>(), vec!["client-a.example.com"]);
        assert!(info.subject_alt_names.contains(&SubjectAltName::Uri(
            "https://client-a.example.com/client".into()
        )));
    }

    #[test]
    fn test_parse_rsa_certificate() {
        let info = validator().parse(CLIENT_B.as_bytes()).into_result().unwrap();
        assert_eq!(info.public_key_algorithm, "RSA");
        assert_eq!(info.public_key_bits, Some(2048));
        assert_eq!(info.thumbprint_sha256, CLIENT_B_S256);
    }

    #[test]
    fn test_der_matches_pem() {
        let pem = validator().parse(CLIENT_A.as_bytes()).into_result().unwrap();
        let der = validator().parse(&pem.der).into_result().unwrap();
        assert_eq!(pem, der);
    }

    #[test]
    fn test_trailing_bytes_outside_thumbprint() {
        let pem = validator().parse(CLIENT_A.as_bytes()).into_result().unwrap();
        let mut padded = pem.der.clone();
        padded.extend_from_slice(b"\x00trailer");

        let info = validator().parse(&padded).into_result().unwrap();
        assert_eq!(info.thumbprint_sha256, CLIENT_A_S256);
        assert_eq!(info.thumbprint_sha1, CLIENT_A_SHA1);
        assert_eq!(info.der, pem.der);
    }

    #[test]
    fn test_expired_reported_not_thrown() {
        let parse = validator().parse(CLIENT_EXPIRED.as_bytes());
        let info = parse.info.as_ref().unwrap();
        assert_eq!(info.thumbprint_sha256, "zYvecLt4dk0AvTdUJ3SE77wq_TjatMVFVlSwI9IIIIk");
        assert_eq!(
            parse.errors,
            vec![CertificateError::Expired {
                not_after: datetime!(2021-01-01 0:00 UTC)
            }]
        );
        assert!(parse.errors[0].is_validity_error());
    }

    #[test]
    fn test_not_yet_valid() {
        let parse = validator().parse(CLIENT_FUTURE.as_bytes());
        assert!(parse.info.is_some());
        assert!(matches!(
            parse.errors.as_slice(),
            [CertificateError::NotYetValid { .. }]
        ));
    }

    #[test]
    fn test_malformed_input() {
        let parse = validator().parse(b"not a certificate");
        assert!(parse.info.is_none());
        assert!(matches!(parse.errors[0], CertificateError::Malformed(_)));

        let pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(validator().parse(pem.as_bytes()).into_result().is_err());
    }

    #[test]
    fn test_normalize_dn() {
        assert_eq!(
            normalize_dn("CN=Client-A, O=Tessera  Test, C=US"),
            "CN=client-a,O=tessera test,C=us"
        );
        assert_eq!(
            normalize_dn("/C=US/O=Tessera Test/CN=client-a"),
            normalize_dn("CN=client-a,O=Tessera Test,C=US")
        );
        assert_eq!(normalize_dn("cn=a\\,b,o=x"), "CN=a\\,b,O=x");
    }

    #[test]
    fn test_escape_dn_value() {
        assert_eq!(escape_dn_value("a,b"), "a\\,b");
        assert_eq!(escape_dn_value("#lead"), "\\#lead");
        assert_eq!(escape_dn_value("plain"), "plain");
    }

    #[test]
    fn test_certificate_error_into_auth_error() {
        let err: AuthError = CertificateError::Timeout {
            url: "https://x".into(),
        }
        .into();
        assert!(matches!(err, AuthError::Timeout { .. }));
        assert!(err.is_retryable());
    }
}
