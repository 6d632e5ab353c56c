//! Encryption at rest.
//!
//! - [`keys`] - Versioned master keys, the key ring and rotation
//! - [`cipher`] - The `standard`, `high` and `extreme` encryption levels
//! - [`integrity`] - Keyed integrity hash over stored records
//! - [`compression`] - Deflate helpers

pub mod cipher;
pub mod compression;
pub mod integrity;
pub mod keys;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use cipher::CipherParams;
pub use keys::{KeyManager, KeyMaterial, KeyProvider, KeyRing, KeyStatus, KeyVersion, LocalKeyProvider};

use crate::error::AuthError;

/// Strength of the encryption applied to a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionLevel {
    /// One AES-256-GCM pass under the master key.
    #[default]
    Standard,
    /// Argon2id-derived key with a fresh salt, then AES-256-GCM.
    High,
    /// Deflate, the `high` scheme, then a second `high`-style wrap under a
    /// separately derived key.
    ///
    /// Both keys come from the same master key, so this adds little over
    /// `High` against a master key compromise.
    Extreme,
}

impl EncryptionLevel {
    /// Returns the storage name of this level.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::High => "high",
            Self::Extreme => "extreme",
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionLevel {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            "extreme" => Ok(Self::Extreme),
            other => Err(CryptoError::Malformed(format!(
                "unknown encryption level '{other}'"
            ))),
        }
    }
}

/// Errors from the encryption layer.
///
/// Messages carry a failure class only, never key material or plaintext.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Authenticated encryption failed.
    #[error("encryption failed")]
    Encrypt,

    /// The AEAD tag did not verify.
    #[error("decryption failed")]
    Decrypt,

    /// Argon2 rejected its parameters or failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Deflate or inflate failed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// The ciphertext or an encoded value has the wrong shape.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// No key material is loaded for the requested version.
    #[error("unknown key version {0}")]
    UnknownKeyVersion(u32),

    /// Key material could not be parsed or generated.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The active key version cannot be purged.
    #[error("key version {0} is active and cannot be purged")]
    ActiveKeyPurge(u32),
}

impl From<CryptoError> for AuthError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKey(_) => AuthError::configuration(err.to_string()),
            CryptoError::KeyDerivation(_) | CryptoError::Compression(_) => {
                AuthError::internal(err.to_string())
            }
            CryptoError::ActiveKeyPurge(_) => AuthError::invalid_request(err.to_string()),
            CryptoError::Encrypt
            | CryptoError::Decrypt
            | CryptoError::Malformed(_)
            | CryptoError::UnknownKeyVersion(_) => AuthError::cryptographic(err.to_string()),
        }
    }
}
