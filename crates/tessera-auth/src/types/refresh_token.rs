//! Opaque refresh token values.
//!
//! The plaintext value is handed to the client once. Only its SHA-256 hash
//! is used for lookups.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// A freshly minted refresh token.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken {
    value: String,
}

impl RefreshToken {
    /// Generates a 256-bit random token, base64url encoded (43 characters).
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            value: URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    /// The plaintext value to return to the client.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The lookup hash of this token.
    #[must_use]
    pub fn hash(&self) -> String {
        hash_token(&self.value)
    }

    #[must_use]
    pub fn into_value(self) -> String {
        self.value
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshToken([redacted])")
    }
}

/// Hex SHA-256 of a token value or identifier.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
