//! Token revocation (RFC 7009).
//!
//! Revocation is by token value. A client may only revoke its own tokens;
//! unknown tokens are not an error, so the endpoint can always answer 200.
//!
//! # References
//!
//! - [RFC 7009 - OAuth 2.0 Token Revocation](https://tools.ietf.org/html/rfc7009)

use serde::{Deserialize, Serialize};

/// Token revocation request.
#[derive(Debug, Clone, Deserialize)]
pub struct RevocationRequest {
    /// The access or refresh token to revoke.
    pub token: String,

    /// Optional hint about the token type.
    #[serde(default)]
    pub token_type_hint: Option<TokenTypeHint>,
}

/// Token type hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTypeHint {
    AccessToken,
    RefreshToken,
}

impl TokenTypeHint {
    /// Returns the token type hint as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
        }
    }

    /// Guesses the hint from the token shape: JWTs have three segments.
    #[must_use]
    pub fn infer(token: &str) -> Self {
        if token.split('.').count() == 3 {
            Self::AccessToken
        } else {
            Self::RefreshToken
        }
    }
}

impl std::fmt::Display for TokenTypeHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reason recorded on a revoked storage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// Revoked by the owning client.
    ClientRequest,
    /// Revoked because its paired refresh token was revoked.
    Cascade,
    /// Revoked after suspected compromise.
    Compromised,
    /// Revoked by an administrator.
    Administrative,
}

impl RevocationReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientRequest => "client_request",
            Self::Cascade => "cascade",
            Self::Compromised => "compromised",
            Self::Administrative => "administrative",
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
