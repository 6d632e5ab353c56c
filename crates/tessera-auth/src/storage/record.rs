//! Encrypted token records.
//!
//! A record is the only thing the persistence layer ever sees: indexable
//! metadata in the clear, the token payload as authenticated ciphertext,
//! and a keyed integrity hash over both.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::crypto::integrity::IntegrityMac;
use crate::crypto::{CryptoError, EncryptionLevel, KeyMaterial};
use crate::token::{AccessTokenClaims, Confirmation};
use crate::{AuthError, AuthResult};

// =============================================================================
// Token Type
// =============================================================================

/// Kind of token a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    AuthorizationCode,
    DeviceCode,
}

impl TokenType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::AuthorizationCode => "authorization_code",
            Self::DeviceCode => "device_code",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(Self::Access),
            "refresh" => Ok(Self::Refresh),
            "authorization_code" => Ok(Self::AuthorizationCode),
            "device_code" => Ok(Self::DeviceCode),
            other => Err(format!("unknown token type: {other}")),
        }
    }
}

// =============================================================================
// Token Payload
// =============================================================================

/// The confidential part of a record, stored only as ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// `jti` for access tokens, the token hash for opaque tokens.
    pub token_id: String,
    pub token_type: TokenType,
    pub client_id: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Space-separated scopes.
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub audience: Vec<String>,
    #[serde(with = "time::serde::timestamp")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Confirmation>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl TokenPayload {
    /// Describes an issued access token.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidRequest` if `iat` or `exp` is not a
    /// representable date.
    pub fn from_claims(claims: &AccessTokenClaims, user_id: Option<String>) -> AuthResult<Self> {
        Ok(Self {
            token_id: claims.jti.clone(),
            token_type: TokenType::Access,
            client_id: claims.client_id.clone(),
            subject: claims.sub.clone(),
            user_id,
            scope: claims.scope.clone(),
            audience: claims.aud.to_vec(),
            issued_at: unix(claims.iat, "iat")?,
            expires_at: unix(claims.exp, "exp")?,
            confirmation: claims.cnf.clone(),
            revoked: false,
            revocation_reason: None,
            extra: claims.extra.clone(),
        })
    }

    /// Describes an opaque token identified by `token_hash`.
    #[must_use]
    pub fn opaque(
        token_type: TokenType,
        token_hash: impl Into<String>,
        client_id: impl Into<String>,
        subject: impl Into<String>,
        scope: impl Into<String>,
        issued_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            token_id: token_hash.into(),
            token_type,
            client_id: client_id.into(),
            subject: subject.into(),
            user_id: None,
            scope: scope.into(),
            audience: Vec::new(),
            issued_at: truncate(issued_at),
            expires_at: truncate(expires_at),
            confirmation: None,
            revoked: false,
            revocation_reason: None,
            extra: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_confirmation(mut self, confirmation: Confirmation) -> Self {
        self.confirmation = Some(confirmation);
        self
    }
}

fn unix(ts: i64, claim: &str) -> AuthResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|_| AuthError::invalid_request(format!("{claim} {ts} is out of range")))
}

/// Drops sub-second precision so timestamps survive any backend unchanged.
#[must_use]
pub fn truncate(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_nanosecond(0).unwrap_or(at)
}

// =============================================================================
// Encrypted Record
// =============================================================================

/// A persisted token record.
///
/// Everything except `access_count`, `last_accessed_at` and `revision` is
/// covered by `integrity_hash`.
#[derive(Clone, PartialEq)]
pub struct EncryptedTokenRecord {
    /// Storage handle, unrelated to the token's `jti`.
    pub storage_id: String,
    pub token_type: TokenType,
    pub client_id: String,
    pub user_id: Option<String>,
    /// Base64 ciphertext.
    pub encrypted_data: String,
    pub encryption_level: EncryptionLevel,
    pub key_version: u32,
    pub is_compressed: bool,
    /// Stored size over sealed size; 1.0 when uncompressed.
    pub compression_ratio: f64,
    /// Hex HMAC-SHA256.
    pub integrity_hash: String,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub is_revoked: bool,
    pub revoked_at: Option<OffsetDateTime>,
    pub revocation_reason: Option<String>,
    pub access_count: u64,
    pub last_accessed_at: Option<OffsetDateTime>,
    /// Optimistic concurrency counter, bumped on every rewrite.
    pub revision: u64,
}

impl EncryptedTokenRecord {
    /// Returns `true` if `now` is at or past `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    fn mac(&self, key: &KeyMaterial) -> Result<IntegrityMac, CryptoError> {
        let mut mac = IntegrityMac::new(key)?;
        mac.field(self.storage_id.as_bytes())
            .field(self.token_type.as_str().as_bytes())
            .field(self.client_id.as_bytes())
            .optional(self.user_id.as_deref().map(str::as_bytes))
            .field(self.encrypted_data.as_bytes())
            .field(self.encryption_level.as_str().as_bytes())
            .field(&self.key_version.to_be_bytes())
            .field(&[u8::from(self.is_compressed)])
            .field(&self.compression_ratio.to_bits().to_be_bytes())
            .field(&self.expires_at.unix_timestamp().to_be_bytes())
            .field(&self.created_at.unix_timestamp().to_be_bytes())
            .field(&[u8::from(self.is_revoked)])
            .optional(
                self.revoked_at
                    .map(|at| at.unix_timestamp().to_be_bytes())
                    .as_ref()
                    .map(<[u8; 8]>::as_slice),
            )
            .optional(self.revocation_reason.as_deref().map(str::as_bytes));
        Ok(mac)
    }

    /// Recomputes and stores the integrity hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the integrity subkey cannot be derived.
    pub fn seal_integrity(&mut self, key: &KeyMaterial) -> Result<(), CryptoError> {
        self.integrity_hash = self.mac(key)?.finalize_hex();
        Ok(())
    }

    /// Checks the integrity hash in constant time.
    ///
    /// # Errors
    ///
    /// Returns an error if the integrity subkey cannot be derived.
    pub fn verify_integrity(&self, key: &KeyMaterial) -> Result<bool, CryptoError> {
        Ok(self.mac(key)?.verify_hex(&self.integrity_hash))
    }
}

impl fmt::Debug for EncryptedTokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedTokenRecord")
            .field("storage_id", &self.storage_id)
            .field("token_type", &self.token_type)
            .field("client_id", &self.client_id)
            .field("encrypted_len", &self.encrypted_data.len())
            .field("encryption_level", &self.encryption_level)
            .field("key_version", &self.key_version)
            .field("expires_at", &self.expires_at)
            .field("is_revoked", &self.is_revoked)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

/// A successfully decrypted record.
#[derive(Debug, Clone)]
pub struct StoredToken {
    pub record: EncryptedTokenRecord,
    pub payload: TokenPayload,
}

impl StoredToken {
    #[must_use]
    pub fn storage_id(&self) -> &str {
        &self.record.storage_id
    }

    /// Returns `true` if either the metadata or the payload says revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.record.is_revoked || self.payload.revoked
    }
}

/// Outcome of reading a record.
#[derive(Debug, Clone)]
pub enum RetrieveOutcome {
    Found(StoredToken),
    NotFound,
    /// The integrity hash did not verify; nothing was decrypted.
    IntegrityFailure,
    /// The record is past `expires_at`.
    Expired,
}

impl RetrieveOutcome {
    /// Returns the token if found.
    #[must_use]
    pub fn found(self) -> Option<StoredToken> {
        match self {
            Self::Found(token) => Some(token),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::datetime;

    pub(crate) fn sample_record() -> EncryptedTokenRecord {
        EncryptedTokenRecord {
            storage_id: "st-1".into(),
            token_type: TokenType::Access,
            client_id: "c1".into(),
            user_id: Some("u1".into()),
            encrypted_data: "Y2lwaGVydGV4dA==".into(),
            encryption_level: EncryptionLevel::High,
            key_version: 1,
            is_compressed: false,
            compression_ratio: 1.0,
            integrity_hash: String::new(),
            expires_at: datetime!(2030-01-01 1:00 UTC),
            created_at: datetime!(2030-01-01 0:00 UTC),
            is_revoked: false,
            revoked_at: None,
            revocation_reason: None,
            access_count: 0,
            last_accessed_at: None,
            revision: 0,
        }
    }

    #[test]
    fn test_token_type_names() {
        for t in [
            TokenType::Access,
            TokenType::Refresh,
            TokenType::AuthorizationCode,
            TokenType::DeviceCode,
        ] {
            assert_eq!(t.as_str().parse::<TokenType>().unwrap(), t);
        }
        assert!("bearer".parse::<TokenType>().is_err());
    }

    #[test]
    fn test_integrity_covers_metadata() {
        let key = KeyMaterial::generate();
        let mut record = sample_record();
        record.seal_integrity(&key).unwrap();
        assert!(record.verify_integrity(&key).unwrap());

        let mut tampered = record.clone();
        tampered.client_id = "c2".into();
        assert!(!tampered.verify_integrity(&key).unwrap());

        let mut tampered = record.clone();
        tampered.expires_at = datetime!(2031-01-01 0:00 UTC);
        assert!(!tampered.verify_integrity(&key).unwrap());

        let mut tampered = record.clone();
        tampered.is_revoked = true;
        assert!(!tampered.verify_integrity(&key).unwrap());

        let mut tampered = record.clone();
        tampered.key_version = 2;
        assert!(!tampered.verify_integrity(&key).unwrap());
    }

    #[test]
    fn test_counters_outside_integrity() {
        let key = KeyMaterial::generate();
        let mut record = sample_record();
        record.seal_integrity(&key).unwrap();

        record.access_count = 7;
        record.last_accessed_at = Some(datetime!(2030-01-01 0:30 UTC));
        record.revision = 3;
        assert!(record.verify_integrity(&key).unwrap());
    }

    #[test]
    fn test_debug_hides_ciphertext() {
        let debug = format!("{:?}", sample_record());
        assert!(!debug.contains("Y2lwaGVydGV4dA"));
        assert!(debug.contains("st-1"));
    }

    #[test]
    fn test_payload_from_claims() {
        let claims = AccessTokenClaims::builder("https://issuer", "user-1", "c1")
            .audience("https://api".into())
            .scopes(["read"])
            .build()
            .unwrap();
        let payload = TokenPayload::from_claims(&claims, None).unwrap();
        assert_eq!(payload.token_id, claims.jti);
        assert_eq!(payload.audience, vec!["https://api"]);
        assert_eq!(payload.expires_at.unix_timestamp(), claims.exp);

        let json = serde_json::to_vec(&payload).unwrap();
        let back: TokenPayload = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_payload_rejects_unrepresentable_expiry() {
        let mut claims = AccessTokenClaims::builder("i", "s", "c").build().unwrap();
        claims.exp = i64::MAX;
        let err = TokenPayload::from_claims(&claims, None).unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));
    }

    #[test]
    fn test_truncate() {
        let at = datetime!(2030-01-01 0:00:00.123456 UTC);
        assert_eq!(truncate(at), datetime!(2030-01-01 0:00 UTC));
    }
}
