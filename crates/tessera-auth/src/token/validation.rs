//! Access token validation.
//!
//! Validation checks cryptographic validity only: signature, algorithm,
//! time window, issuer, audience, scopes and resource. Revocation and
//! certificate binding are checked by the lifecycle service.
//!
//! Every failed check is collected. A token with any error is invalid.

use std::collections::HashSet;
use std::fmt;

use jsonwebtoken::{Validation, decode, decode_header};
use serde_json::{Map, Value};

use super::claims::AccessTokenClaims;
use super::jwt::{JwtError, JwtService, SigningAlgorithm};
use crate::error::AuthError;

/// Claims every access token must carry.
pub const REQUIRED_CLAIMS: &[&str] = &["iss", "sub", "aud", "exp", "iat", "jti", "client_id"];

const ACCEPTED_TYP: &[&str] = &["at+jwt", "application/at+jwt"];

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token is not yet valid")]
    NotYetValid,

    #[error("token signature is invalid")]
    BadSignature,

    #[error("token audience does not match")]
    AudienceMismatch,

    #[error("token issuer does not match")]
    IssuerMismatch,

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("missing required claim: {0}")]
    MissingRequiredClaim(String),

    #[error("insufficient scope, missing: {}", .0.join(" "))]
    InsufficientScope(Vec<String>),

    #[error("token is not valid for the requested resource")]
    ResourceMismatch,

    #[error("malformed token: {0}")]
    Malformed(String),
}

impl From<TokenValidationError> for AuthError {
    fn from(err: TokenValidationError) -> Self {
        match err {
            TokenValidationError::Expired => AuthError::TokenExpired,
            TokenValidationError::NotYetValid => AuthError::NotYetValid,
            TokenValidationError::BadSignature => {
                AuthError::cryptographic("invalid token signature")
            }
            TokenValidationError::UnsupportedAlgorithm(alg) => {
                AuthError::unsupported_algorithm(alg)
            }
            TokenValidationError::InsufficientScope(_) => AuthError::invalid_scope(err.to_string()),
            other => AuthError::invalid_token(other.to_string()),
        }
    }
}

/// Optional expectations checked against the token.
#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Audience the caller requires.
    pub audience: Option<String>,
    /// Scopes that must all be granted.
    pub required_scopes: Vec<String>,
    /// Resource the token must be valid for.
    pub resource: Option<String>,
}

impl ValidationOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    #[must_use]
    pub fn require_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Result of validating a token.
///
/// `claims` is present whenever the signature verified, even if other
/// checks failed, so callers can log the `jti` of a rejected token.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub claims: Option<AccessTokenClaims>,
    pub errors: Vec<TokenValidationError>,
}

impl ValidationOutcome {
    fn rejected(error: TokenValidationError) -> Self {
        Self {
            claims: None,
            errors: vec![error],
        }
    }

    /// Returns `true` if the signature verified and every check passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.claims.is_some() && self.errors.is_empty()
    }

    /// Returns `true` if `error` was reported.
    #[must_use]
    pub fn has_error(&self, error: &TokenValidationError) -> bool {
        self.errors.contains(error)
    }

    /// Converts into the claims, or the first error.
    ///
    /// # Errors
    /// Returns the first validation error if the token is invalid.
    pub fn into_result(self) -> Result<AccessTokenClaims, TokenValidationError> {
        match (self.claims, self.errors.into_iter().next()) {
            (_, Some(error)) => Err(error),
            (Some(claims), None) => Ok(claims),
            (None, None) => Err(TokenValidationError::Malformed("no claims".into())),
        }
    }
}

impl fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            return write!(f, "valid");
        }
        let reasons: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "invalid: {}", reasons.join("; "))
    }
}

impl JwtService {
    /// Validates a JWT access token.
    ///
    /// The header algorithm must be in the allow-list and must exactly
    /// match the algorithm of the key named by `kid`, so a token signed
    /// with an HMAC secret can never be checked against an asymmetric key
    /// or vice versa.
    #[must_use]
    pub fn validate(&self, token: &str, options: &ValidationOptions) -> ValidationOutcome {
        let header = match decode_header(token) {
            Ok(header) => header,
            Err(e) => return ValidationOutcome::rejected(classify(e.into())),
        };

        let Some(algorithm) = SigningAlgorithm::from_jwt_algorithm(header.alg)
            .filter(|alg| self.allowed_algorithms().contains(alg))
        else {
            return ValidationOutcome::rejected(TokenValidationError::UnsupportedAlgorithm(
                format!("{:?}", header.alg),
            ));
        };

        if !header
            .typ
            .as_deref()
            .is_some_and(|typ| ACCEPTED_TYP.iter().any(|t| t.eq_ignore_ascii_case(typ)))
        {
            return ValidationOutcome::rejected(TokenValidationError::Malformed(
                "header typ is not at+jwt".into(),
            ));
        }

        let Some(key) = self.verification_key(header.kid.as_deref()) else {
            return ValidationOutcome::rejected(TokenValidationError::BadSignature);
        };
        if key.algorithm != algorithm {
            return ValidationOutcome::rejected(TokenValidationError::UnsupportedAlgorithm(
                algorithm.to_string(),
            ));
        }

        let mut validation = Validation::new(algorithm.to_jwt_algorithm());
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let raw = match decode::<Map<String, Value>>(token, key.decoding_key(), &validation) {
            Ok(data) => data.claims,
            Err(e) => return ValidationOutcome::rejected(classify(e.into())),
        };

        let missing: Vec<TokenValidationError> = REQUIRED_CLAIMS
            .iter()
            .filter(|name| raw.get(**name).is_none_or(Value::is_null))
            .map(|name| TokenValidationError::MissingRequiredClaim((*name).to_string()))
            .collect();
        if !missing.is_empty() {
            return ValidationOutcome {
                claims: None,
                errors: missing,
            };
        }

        let claims: AccessTokenClaims = match serde_json::from_value(Value::Object(raw)) {
            Ok(claims) => claims,
            Err(e) => {
                return ValidationOutcome::rejected(TokenValidationError::Malformed(e.to_string()));
            }
        };

        let errors = self.check_claims(&claims, options);
        ValidationOutcome {
            claims: Some(claims),
            errors,
        }
    }

    fn check_claims(
        &self,
        claims: &AccessTokenClaims,
        options: &ValidationOptions,
    ) -> Vec<TokenValidationError> {
        let mut errors = Vec::new();
        let now = self.clock().unix_timestamp();
        let leeway = i64::try_from(self.leeway().as_secs()).unwrap_or(i64::MAX);

        if now >= claims.exp.saturating_add(leeway) {
            errors.push(TokenValidationError::Expired);
        }
        if claims
            .nbf
            .is_some_and(|nbf| nbf > now.saturating_add(leeway))
        {
            errors.push(TokenValidationError::NotYetValid);
        }

        if claims.iss != self.issuer() {
            errors.push(TokenValidationError::IssuerMismatch);
        }

        if let Some(expected) = options.audience.as_deref()
            && !claims.aud.contains(expected)
        {
            errors.push(TokenValidationError::AudienceMismatch);
        }

        let missing_scopes: Vec<String> = options
            .required_scopes
            .iter()
            .filter(|scope| !claims.has_scope(scope))
            .cloned()
            .collect();
        if !missing_scopes.is_empty() {
            errors.push(TokenValidationError::InsufficientScope(missing_scopes));
        }

        if let Some(expected) = options.resource.as_deref() {
            let allowed = match &claims.resource {
                Some(resources) => resources.iter().any(|r| r == expected),
                None => claims.aud.contains(expected),
            };
            if !allowed {
                errors.push(TokenValidationError::ResourceMismatch);
            }
        }

        errors
    }
}

fn classify(error: JwtError) -> TokenValidationError {
    match error {
        JwtError::InvalidSignature => TokenValidationError::BadSignature,
        JwtError::UnsupportedAlgorithm { algorithm } => {
            TokenValidationError::UnsupportedAlgorithm(algorithm)
        }
        JwtError::MissingClaim { claim } => TokenValidationError::MissingRequiredClaim(claim),
        other => TokenValidationError::Malformed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::clock::ManualClock;
    use crate::token::claims::Audience;
    use crate::token::jwt::{SigningKeyPair, TokenRequest};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(datetime!(2030-01-01 0:00 UTC)))
    }

    fn service(clock: Arc<ManualClock>) -> JwtService {
        let key = SigningKeyPair::from_secret("hs-1", SigningAlgorithm::HS256, SECRET).unwrap();
        JwtService::new(key, "https://auth.example.com")
            .with_default_audience("https://api.example.com")
            .with_clock(clock)
    }

    fn issue(service: &JwtService, scopes: &[&str]) -> (String, AccessTokenClaims) {
        service
            .issue(
                TokenRequest::new("user-1", "c1")
                    .with_scopes(scopes.iter().copied())
                    .with_ttl(Duration::from_secs(3600)),
            )
            .unwrap()
    }

    #[test]
    fn test_valid_token() {
        let service = service(clock());
        let (token, issued) = issue(&service, &["read", "write"]);

        let options = ValidationOptions::new()
            .audience("https://api.example.com")
            .require_scopes(["read"]);
        let outcome = service.validate(&token, &options);
        assert!(outcome.is_valid(), "{outcome}");
        assert_eq!(outcome.into_result().unwrap(), issued);
    }

    #[test]
    fn test_expired_after_clock_advance() {
        let clock = clock();
        let service = service(clock.clone());
        let (token, _) = issue(&service, &["read"]);

        clock.advance(Duration::from_secs(3599));
        assert!(service.validate(&token, &ValidationOptions::new()).is_valid());

        clock.advance(Duration::from_secs(1));
        let outcome = service.validate(&token, &ValidationOptions::new());
        assert!(!outcome.is_valid());
        assert!(outcome.has_error(&TokenValidationError::Expired));
        assert!(outcome.claims.is_some());
    }

    #[test]
    fn test_leeway_extends_expiry() {
        let clock = clock();
        let service = service(clock.clone()).with_leeway(Duration::from_secs(30));
        let (token, _) = issue(&service, &[]);

        clock.advance(Duration::from_secs(3610));
        assert!(service.validate(&token, &ValidationOptions::new()).is_valid());
        clock.advance(Duration::from_secs(30));
        assert!(!service.validate(&token, &ValidationOptions::new()).is_valid());
    }

    #[test]
    fn test_audience_scope_and_resource_mismatch_collected() {
        let service = service(clock());
        let (token, _) = issue(&service, &["read"]);

        let options = ValidationOptions::new()
            .audience("https://other.example.com")
            .require_scopes(["read", "admin"])
            .resource("https://rs.example.com");
        let outcome = service.validate(&token, &options);
        assert!(!outcome.is_valid());
        assert!(outcome.has_error(&TokenValidationError::AudienceMismatch));
        assert!(outcome.has_error(&TokenValidationError::InsufficientScope(vec![
            "admin".into()
        ])));
        assert!(outcome.has_error(&TokenValidationError::ResourceMismatch));
    }

    #[test]
    fn test_resource_claim_restricts() {
        let service = service(clock());
        let (token, _) = service
            .issue(
                TokenRequest::new("u", "c1")
                    .with_audience(Audience::Single("https://api.example.com".into()))
                    .with_resource(vec!["https://rs-a".into()]),
            )
            .unwrap();

        let ok = ValidationOptions::new().resource("https://rs-a");
        assert!(service.validate(&token, &ok).is_valid());
        let bad = ValidationOptions::new().resource("https://api.example.com");
        assert!(service.validate(&token, &bad).has_error(&TokenValidationError::ResourceMismatch));
    }

    #[test]
    fn test_issuer_mismatch() {
        let clock = clock();
        let issuer = service(clock.clone());
        let (token, _) = issue(&issuer, &[]);

        let key = SigningKeyPair::from_secret("hs-1", SigningAlgorithm::HS256, SECRET).unwrap();
        let other = JwtService::new(key, "https://evil.example.com").with_clock(clock);
        let outcome = other.validate(&token, &ValidationOptions::new());
        assert!(outcome.has_error(&TokenValidationError::IssuerMismatch));
    }

    #[test]
    fn test_bad_signature() {
        let service = service(clock());
        let (token, _) = issue(&service, &["read"]);

        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        let mut payload: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(&parts[1]).unwrap()).unwrap();
        payload["scope"] = json!("read admin");
        parts[1] = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        let forged = parts.join(".");

        let outcome = service.validate(&forged, &ValidationOptions::new());
        assert_eq!(outcome.errors, vec![TokenValidationError::BadSignature]);
        assert!(outcome.claims.is_none());
    }

    #[test]
    fn test_algorithm_not_in_allow_list() {
        let service = service(clock());
        let mut header = Header::new(jsonwebtoken::Algorithm::HS512);
        header.typ = Some("at+jwt".into());
        let token = encode(
            &header,
            &json!({"iss": "https://auth.example.com"}),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let outcome = service.validate(&token, &ValidationOptions::new());
        assert!(matches!(
            outcome.errors.as_slice(),
            [TokenValidationError::UnsupportedAlgorithm(_)]
        ));
    }

    #[test]
    fn test_hmac_token_against_asymmetric_key_rejected() {
        let ec = SigningKeyPair::generate_ec().unwrap();
        let ec_kid = ec.kid.clone();
        let service = JwtService::new(ec, "https://auth.example.com")
            .with_allowed_algorithms(vec![SigningAlgorithm::ES384, SigningAlgorithm::HS256])
            .unwrap();

        let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
        header.typ = Some("at+jwt".into());
        header.kid = Some(ec_kid);
        let token = encode(&header, &json!({}), &EncodingKey::from_secret(SECRET)).unwrap();

        let outcome = service.validate(&token, &ValidationOptions::new());
        assert_eq!(
            outcome.errors,
            vec![TokenValidationError::UnsupportedAlgorithm("HS256".into())]
        );
    }

    #[test]
    fn test_missing_claims_and_typ() {
        let service = service(clock());

        let mut header = Header::new(jsonwebtoken::Algorithm::HS256);
        header.kid = Some("hs-1".into());
        let no_typ = encode(&header, &json!({}), &EncodingKey::from_secret(SECRET)).unwrap();
        assert!(matches!(
            service.validate(&no_typ, &ValidationOptions::new()).errors[0],
            TokenValidationError::Malformed(_)
        ));

        header.typ = Some("at+jwt".into());
        let empty = encode(&header, &json!({"iss": "x"}), &EncodingKey::from_secret(SECRET)).unwrap();
        let outcome = service.validate(&empty, &ValidationOptions::new());
        assert!(outcome.has_error(&TokenValidationError::MissingRequiredClaim("jti".into())));
        assert!(!outcome.has_error(&TokenValidationError::MissingRequiredClaim("iss".into())));
    }

    #[test]
    fn test_verification_key_set() {
        let clock = clock();
        let old = SigningKeyPair::from_secret("old", SigningAlgorithm::HS256, SECRET).unwrap();
        let old_service = JwtService::new(old, "https://auth.example.com")
            .with_default_audience("https://api")
            .with_clock(clock.clone());
        let (token, _) = issue(&old_service, &[]);

        let current = SigningKeyPair::generate_hmac(SigningAlgorithm::HS256).unwrap();
        let rotated = JwtService::new(current, "https://auth.example.com").with_clock(clock.clone());
        assert!(
            rotated
                .validate(&token, &ValidationOptions::new())
                .has_error(&TokenValidationError::BadSignature)
        );

        let old = SigningKeyPair::from_secret("old", SigningAlgorithm::HS256, SECRET).unwrap();
        let rotated = rotated.with_verification_key(old);
        assert!(rotated.validate(&token, &ValidationOptions::new()).is_valid());
    }

    #[test]
    fn test_ec_token_roundtrip_with_extra_claims() {
        let key = SigningKeyPair::generate_ec().unwrap();
        let service = JwtService::new(key, "https://auth.example.com").with_default_audience("a");
        let mut extra = BTreeMap::new();
        extra.insert("tenant".to_string(), json!("acme"));
        let (token, _) = service
            .issue(TokenRequest::new("u", "c1").with_extra_claims(extra))
            .unwrap();

        let claims = service
            .validate(&token, &ValidationOptions::new())
            .into_result()
            .unwrap();
        assert_eq!(claims.extra["tenant"], "acme");
    }

    #[test]
    fn test_garbage_is_malformed() {
        let service = service(clock());
        let outcome = service.validate("not-a-jwt", &ValidationOptions::new());
        assert!(!outcome.is_valid());
        assert!(matches!(outcome.errors[0], TokenValidationError::Malformed(_)));
    }

    #[test]
    fn test_validation_error_into_auth_error() {
        assert!(matches!(
            AuthError::from(TokenValidationError::Expired),
            AuthError::TokenExpired
        ));
        assert!(AuthError::from(TokenValidationError::BadSignature).is_cryptographic());
    }
}
