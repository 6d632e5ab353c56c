//! Certificate-bound access tokens (RFC 8705).
//!
//! At issuance the client certificate's SHA-256 thumbprint goes into the
//! token's `cnf` claim. On every later use the certificate presented on that
//! request is thumbprinted again and must match exactly.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use constant_time_eq::constant_time_eq;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use super::certificate::{CertificateInfo, normalize_dn};
use crate::token::{Confirmation, Jwk};
use crate::types::RegisteredClient;

/// Builds the `cnf` claim for a certificate.
#[must_use]
pub fn bind_token(info: &CertificateInfo, include_legacy_thumbprint: bool) -> Confirmation {
    Confirmation {
        x5t_s256: Some(info.thumbprint_sha256.clone()),
        x5t: include_legacy_thumbprint.then(|| info.thumbprint_sha1.clone()),
        jkt: None,
    }
}

/// Checks a certificate-bound token against the certificate on this request.
///
/// Fails when the token carries no `x5t#S256`, when no certificate was
/// presented, or when any embedded thumbprint differs.
#[must_use]
pub fn verify_bound_token(cnf: &Confirmation, presented: Option<&CertificateInfo>) -> bool {
    let (Some(expected), Some(presented)) = (cnf.x5t_s256.as_deref(), presented) else {
        return false;
    };
    if !constant_time_eq(expected.as_bytes(), presented.thumbprint_sha256.as_bytes()) {
        return false;
    }
    match cnf.x5t.as_deref() {
        Some(legacy) => constant_time_eq(legacy.as_bytes(), presented.thumbprint_sha1.as_bytes()),
        None => true,
    }
}

/// Checks a presented certificate against a client's registered binding.
///
/// A registered thumbprint must match exactly; otherwise the normalized
/// subject DN must match. A binding with neither never matches. The
/// binding's own validity window must contain `now`.
#[must_use]
pub fn match_client(info: &CertificateInfo, client: &RegisteredClient, now: OffsetDateTime) -> bool {
    let Some(binding) = &client.certificate_binding else {
        return false;
    };
    if !binding.is_valid_at(now) {
        return false;
    }

    if binding.thumbprint_sha256.is_some() || binding.thumbprint_sha1.is_some() {
        let sha256_ok = binding.thumbprint_sha256.as_deref().is_none_or(|expected| {
            constant_time_eq(expected.as_bytes(), info.thumbprint_sha256.as_bytes())
        });
        let sha1_ok = binding.thumbprint_sha1.as_deref().is_none_or(|expected| {
            constant_time_eq(expected.as_bytes(), info.thumbprint_sha1.as_bytes())
        });
        return sha256_ok && sha1_ok;
    }

    binding
        .subject_dn
        .as_deref()
        .is_some_and(|dn| normalize_dn(dn) == normalize_dn(&info.subject_dn))
}

/// Computes the RFC 7638 SHA-256 thumbprint of a public JWK.
///
/// Returns `None` if a required member for the key type is missing.
#[must_use]
pub fn jwk_thumbprint(jwk: &Jwk) -> Option<String> {
    // Members in lexicographic order, no whitespace. Values are base64url
    // or curve names and need no JSON escaping.
    let canonical = match jwk.kty.as_str() {
        "EC" => format!(
            r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
            jwk.crv.as_deref()?,
            jwk.x.as_deref()?,
            jwk.y.as_deref()?
        ),
        "RSA" => format!(
            r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
            jwk.e.as_deref()?,
            jwk.n.as_deref()?
        ),
        _ => return None,
    };
    Some(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}
