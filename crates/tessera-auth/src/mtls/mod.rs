//! Mutual-TLS client certificates and certificate-bound tokens.
//!
//! - [`certificate`] - Parsing, thumbprints and validity checks
//! - [`binding`] - `cnf` claims, client matching and proof-of-possession
//! - [`fetch`] - Remote retrieval of registered certificates

pub mod binding;
pub mod certificate;
pub mod fetch;

pub use binding::{bind_token, jwk_thumbprint, match_client, verify_bound_token};
pub use certificate::{
    CertificateError, CertificateInfo, CertificateParse, CertificateValidator, SubjectAltName,
    normalize_dn,
};
pub use fetch::CertificateFetcher;
