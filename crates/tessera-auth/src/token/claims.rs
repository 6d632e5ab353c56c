//! Access token claims (RFC 9068).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::jwt::JwtError;

/// Claim names callers may not set through custom claims.
pub const RESERVED_CLAIMS: &[&str] = &[
    "iss",
    "sub",
    "aud",
    "exp",
    "iat",
    "nbf",
    "jti",
    "client_id",
    "scope",
    "token_type",
    "token_use",
    "cnf",
    "resource",
];

/// The `token_use` value carried by access tokens.
pub const ACCESS_TOKEN_USE: &str = "access";

// ============================================================================
// Audience
// ============================================================================

/// The `aud` claim: a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// One audience, serialized as a string.
    Single(String),
    /// Several audiences, serialized as an array.
    Multiple(Vec<String>),
}

impl Audience {
    /// Builds an audience, collapsing a one-element list to `Single`.
    #[must_use]
    pub fn from_vec(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            Self::Single(values.remove(0))
        } else {
            Self::Multiple(values)
        }
    }

    /// Returns `true` if `value` is one of the audiences.
    #[must_use]
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Self::Single(aud) => aud == value,
            Self::Multiple(auds) => auds.iter().any(|aud| aud == value),
        }
    }

    /// Returns the audiences as a list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Single(aud) => vec![aud.clone()],
            Self::Multiple(auds) => auds.clone(),
        }
    }

    /// Returns `true` if there is no audience.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single(aud) => aud.is_empty(),
            Self::Multiple(auds) => auds.is_empty(),
        }
    }
}

impl From<&str> for Audience {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<String> for Audience {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

// ============================================================================
// Confirmation
// ============================================================================

/// The `cnf` proof-of-possession claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Base64url SHA-256 thumbprint of the bound certificate (RFC 8705).
    #[serde(rename = "x5t#S256", skip_serializing_if = "Option::is_none")]
    pub x5t_s256: Option<String>,

    /// Base64url SHA-1 thumbprint of the bound certificate (legacy).
    #[serde(rename = "x5t", skip_serializing_if = "Option::is_none")]
    pub x5t: Option<String>,

    /// Base64url RFC 7638 thumbprint of the bound JWK.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jkt: Option<String>,
}

impl Confirmation {
    /// Creates a JWK-thumbprint confirmation.
    #[must_use]
    pub fn jwk_thumbprint(jkt: impl Into<String>) -> Self {
        Self {
            jkt: Some(jkt.into()),
            ..Self::default()
        }
    }

    /// Returns `true` if the token is bound to a client certificate.
    #[must_use]
    pub fn is_certificate_bound(&self) -> bool {
        self.x5t_s256.is_some()
    }

    /// Returns `true` if the token is bound to a JWK.
    #[must_use]
    pub fn is_key_bound(&self) -> bool {
        self.jkt.is_some()
    }

    /// Returns `true` if no confirmation method is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x5t_s256.is_none() && self.x5t.is_none() && self.jkt.is_none()
    }
}

// ============================================================================
// Access Token Claims
// ============================================================================

/// Claims of a JWT access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Issuer.
    pub iss: String,

    /// Subject (user or client ID).
    pub sub: String,

    /// Audience.
    pub aud: Audience,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    /// Issued at (Unix timestamp).
    pub iat: i64,

    /// Not before (Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// JWT ID (unique identifier for revocation).
    pub jti: String,

    /// OAuth client ID.
    pub client_id: String,

    /// Space-separated scopes.
    #[serde(default)]
    pub scope: String,

    /// Token use marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_use: Option<String>,

    /// Confirmation claim for sender-constrained tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,

    /// Resource indicators the token is restricted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Vec<String>>,

    /// Caller-supplied claims.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AccessTokenClaims {
    /// Creates a new builder for access token claims.
    #[must_use]
    pub fn builder(
        issuer: impl Into<String>,
        subject: impl Into<String>,
        client_id: impl Into<String>,
    ) -> AccessTokenClaimsBuilder {
        AccessTokenClaimsBuilder::new(issuer, subject, client_id)
    }

    /// Iterates the granted scopes.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }

    /// Returns `true` if `scope` was granted.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().any(|s| s == scope)
    }

    /// Returns the expiry as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.exp).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Returns `true` if the token's confirmation requires a client certificate.
    #[must_use]
    pub fn is_certificate_bound(&self) -> bool {
        self.cnf.as_ref().is_some_and(Confirmation::is_certificate_bound)
    }
}

/// Builder for `AccessTokenClaims`.
pub struct AccessTokenClaimsBuilder {
    iss: String,
    sub: String,
    aud: Audience,
    iat: i64,
    lifetime: Duration,
    jti: String,
    scope: String,
    client_id: String,
    cnf: Option<Confirmation>,
    resource: Option<Vec<String>>,
    extra: BTreeMap<String, Value>,
}

impl AccessTokenClaimsBuilder {
    fn new(
        issuer: impl Into<String>,
        subject: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            iss: issuer.into(),
            sub: subject.into(),
            aud: Audience::Multiple(Vec::new()),
            iat: OffsetDateTime::now_utc().unix_timestamp(),
            lifetime: Duration::from_secs(3600), // Default 1 hour
            jti: uuid::Uuid::new_v4().to_string(),
            scope: String::new(),
            client_id: client_id.into(),
            cnf: None,
            resource: None,
            extra: BTreeMap::new(),
        }
    }

    /// Sets the audience.
    #[must_use]
    pub fn audience(mut self, aud: Audience) -> Self {
        self.aud = aud;
        self
    }

    /// Sets the issue time.
    #[must_use]
    pub fn issued_at(mut self, at: OffsetDateTime) -> Self {
        self.iat = at.unix_timestamp();
        self
    }

    /// Sets the lifetime.
    #[must_use]
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Sets the scopes from a list.
    #[must_use]
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = String::new();
        for scope in scopes {
            if !joined.is_empty() {
                joined.push(' ');
            }
            joined.push_str(scope.as_ref());
        }
        self.scope = joined;
        self
    }

    /// Sets the confirmation claim.
    #[must_use]
    pub fn confirmation(mut self, cnf: Confirmation) -> Self {
        self.cnf = Some(cnf);
        self
    }

    /// Restricts the token to resource indicators.
    #[must_use]
    pub fn resource(mut self, resource: Vec<String>) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Adds caller-supplied claims.
    #[must_use]
    pub fn extra_claims(mut self, extra: BTreeMap<String, Value>) -> Self {
        self.extra.extend(extra);
        self
    }

    /// Builds the access token claims.
    ///
    /// # Errors
    ///
    /// Returns `JwtError::InvalidClaims` if a custom claim uses a reserved
    /// name, the lifetime is zero, or the expiry is not a representable
    /// date.
    pub fn build(self) -> Result<AccessTokenClaims, JwtError> {
        if let Some(name) = self
            .extra
            .keys()
            .find(|name| RESERVED_CLAIMS.contains(&name.as_str()))
        {
            return Err(JwtError::invalid_claims(format!(
                "custom claim '{name}' uses a reserved name"
            )));
        }

        let lifetime = i64::try_from(self.lifetime.as_secs())
            .map_err(|_| JwtError::invalid_claims("lifetime too large"))?;
        if lifetime <= 0 {
            return Err(JwtError::invalid_claims("lifetime must be positive"));
        }

        let exp = self
            .iat
            .checked_add(lifetime)
            .filter(|exp| OffsetDateTime::from_unix_timestamp(*exp).is_ok())
            .ok_or_else(|| JwtError::invalid_claims("lifetime puts expiry out of range"))?;

        Ok(AccessTokenClaims {
            iss: self.iss,
            sub: self.sub,
            aud: self.aud,
            exp,
            iat: self.iat,
            nbf: None,
            jti: self.jti,
            client_id: self.client_id,
            scope: self.scope,
            token_use: Some(ACCESS_TOKEN_USE.to_string()),
            cnf: self.cnf,
            resource: self.resource,
            extra: self.extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_audience_serde_shapes() {
        let single: Audience = serde_json::from_value(json!("https://api")).unwrap();
        assert_eq!(single, Audience::Single("https://api".into()));
        assert!(single.contains("https://api"));

        let multi: Audience = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert!(multi.contains("b"));
        assert!(!multi.contains("c"));
        assert_eq!(serde_json::to_value(&multi).unwrap(), json!(["a", "b"]));

        assert_eq!(
            Audience::from_vec(vec!["only".into()]),
            Audience::Single("only".into())
        );
    }

    #[test]
    fn test_confirmation_serde_names() {
        let cnf = Confirmation {
            x5t_s256: Some("abc".into()),
            x5t: Some("def".into()),
            jkt: None,
        };
        assert_eq!(
            serde_json::to_value(&cnf).unwrap(),
            json!({"x5t#S256": "abc", "x5t": "def"})
        );
        assert!(cnf.is_certificate_bound());
        assert!(!cnf.is_key_bound());
        assert!(Confirmation::default().is_empty());
    }

    #[test]
    fn test_builder_defaults() {
        let claims = AccessTokenClaims::builder("https://issuer", "user-1", "c1")
            .scopes(["read", "write"])
            .build()
            .unwrap();

        assert_eq!(claims.scope, "read write");
        assert_eq!(claims.exp - claims.iat, 3600);
        assert_eq!(claims.token_use.as_deref(), Some("access"));
        assert!(uuid::Uuid::parse_str(&claims.jti).is_ok());
        assert!(claims.has_scope("write"));
        assert!(!claims.has_scope("admin"));
    }

    #[test]
    fn test_builder_generates_unique_jti() {
        let a = AccessTokenClaims::builder("i", "s", "c").build().unwrap();
        let b = AccessTokenClaims::builder("i", "s", "c").build().unwrap();
        assert_ne!(a.jti, b.jti);
    }

    #[test]
    fn test_reserved_custom_claim_rejected() {
        for name in RESERVED_CLAIMS {
            let mut extra = BTreeMap::new();
            extra.insert((*name).to_string(), json!("x"));
            let err = AccessTokenClaims::builder("i", "s", "c")
                .extra_claims(extra)
                .build()
                .unwrap_err();
            assert!(matches!(err, JwtError::InvalidClaims { .. }), "{name}");
        }
    }

    #[test]
    fn test_zero_lifetime_rejected() {
        let err = AccessTokenClaims::builder("i", "s", "c")
            .lifetime(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, JwtError::InvalidClaims { .. }));
    }

    #[test]
    fn test_overflowing_lifetime_rejected() {
        for secs in [i64::MAX as u64, 400_000_000_000] {
            let err = AccessTokenClaims::builder("i", "s", "c")
                .lifetime(Duration::from_secs(secs))
                .build()
                .unwrap_err();
            assert!(matches!(err, JwtError::InvalidClaims { .. }), "{secs}");
        }
    }

    #[test]
    fn test_extra_claims_flatten() {
        let mut extra = BTreeMap::new();
        extra.insert("tenant".to_string(), json!("acme"));
        let claims = AccessTokenClaims::builder("i", "s", "c")
            .audience("https://api".into())
            .extra_claims(extra)
            .build()
            .unwrap();

        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["tenant"], "acme");
        assert_eq!(value["aud"], "https://api");
        assert!(value.get("cnf").is_none());

        let parsed: AccessTokenClaims = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, claims);
    }
}
