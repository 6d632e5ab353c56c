//! Token introspection (RFC 7662).
//!
//! Introspection never fails: every problem with a token collapses into
//! `{"active":false}` on the wire. The reason is kept alongside the
//! response for logging but is never serialized.
//!
//! # References
//!
//! - [RFC 7662 - OAuth 2.0 Token Introspection](https://tools.ietf.org/html/rfc7662)
//! - [RFC 8705 §3.2 - Confirmation method in introspection](https://tools.ietf.org/html/rfc8705#section-3.2)

use std::fmt;

use serde::{Deserialize, Serialize};

use super::claims::{AccessTokenClaims, Confirmation};
use super::revocation::TokenTypeHint;

/// Token introspection request.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectionRequest {
    /// The token to introspect.
    pub token: String,

    /// Optional hint about the token type.
    #[serde(default)]
    pub token_type_hint: Option<TokenTypeHint>,
}

/// Token introspection response.
///
/// Inactive responses carry no other member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntrospectionResponse {
    /// Whether the token is currently active.
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Token type ("Bearer" or "N_A" for refresh tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Confirmation claim of a sender-constrained token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
}

impl IntrospectionResponse {
    /// Creates the inactive response.
    #[must_use]
    pub fn inactive() -> Self {
        Self::default()
    }

    /// Creates an active response from verified claims.
    #[must_use]
    pub fn from_claims(claims: &AccessTokenClaims) -> Self {
        Self {
            active: true,
            scope: Some(claims.scope.clone()),
            client_id: Some(claims.client_id.clone()),
            token_type: Some("Bearer".to_string()),
            exp: Some(claims.exp),
            iat: Some(claims.iat),
            nbf: claims.nbf,
            sub: Some(claims.sub.clone()),
            aud: Some(claims.aud.to_vec()),
            iss: Some(claims.iss.clone()),
            jti: Some(claims.jti.clone()),
            cnf: claims.cnf.clone(),
        }
    }
}

/// Why a token was reported inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InactiveReason {
    /// Signature, algorithm, issuer or claim checks failed.
    Invalid,
    /// The token is past `exp` or before `nbf`.
    Expired,
    /// The storage record is marked revoked.
    Revoked,
    /// No storage record exists for the token.
    NotFound,
    /// The storage record failed its integrity check.
    IntegrityFailure,
    /// The presented certificate is missing or does not match `cnf`.
    BindingMismatch,
    /// The store could not be read.
    Unavailable,
}

impl InactiveReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::NotFound => "not_found",
            Self::IntegrityFailure => "integrity_failure",
            Self::BindingMismatch => "binding_mismatch",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for InactiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Introspection result: the wire response plus the internal reason.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrospectionOutcome {
    pub response: IntrospectionResponse,
    pub inactive_reason: Option<InactiveReason>,
}

impl IntrospectionOutcome {
    #[must_use]
    pub fn active(response: IntrospectionResponse) -> Self {
        Self {
            response,
            inactive_reason: None,
        }
    }

    #[must_use]
    pub fn inactive(reason: InactiveReason) -> Self {
        Self {
            response: IntrospectionResponse::inactive(),
            inactive_reason: Some(reason),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.response.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::claims::Audience;

    #[test]
    fn test_request_deserialization() {
        let request: IntrospectionRequest =
            serde_json::from_str(r#"{"token": "abc123", "token_type_hint": "refresh_token"}"#)
                .unwrap();
        assert_eq!(request.token, "abc123");
        assert_eq!(request.token_type_hint, Some(TokenTypeHint::RefreshToken));

        let request: IntrospectionRequest = serde_json::from_str(r#"{"token": "x"}"#).unwrap();
        assert!(request.token_type_hint.is_none());
    }

    #[test]
    fn test_inactive_is_bare() {
        let outcome = IntrospectionOutcome::inactive(InactiveReason::BindingMismatch);
        assert!(!outcome.is_active());
        assert_eq!(
            serde_json::to_string(&outcome.response).unwrap(),
            r#"{"active":false}"#
        );
        assert_eq!(outcome.inactive_reason.unwrap().as_str(), "binding_mismatch");
    }

    #[test]
    fn test_active_from_claims() {
        let mut claims = AccessTokenClaims::builder("https://issuer", "user-1", "c1")
            .audience(Audience::Multiple(vec!["a".into(), "b".into()]))
            .scopes(["read", "write"])
            .build()
            .unwrap();
        claims.cnf = Some(Confirmation {
            x5t_s256: Some("thumb".into()),
            ..Confirmation::default()
        });

        let response = IntrospectionResponse::from_claims(&claims);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["active"], true);
        assert_eq!(json["scope"], "read write");
        assert_eq!(json["aud"], serde_json::json!(["a", "b"]));
        assert_eq!(json["cnf"]["x5t#S256"], "thumb");
        assert_eq!(json["token_type"], "Bearer");
        assert!(json.get("nbf").is_none());
    }
}
