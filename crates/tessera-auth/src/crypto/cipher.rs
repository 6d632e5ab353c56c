//! Authenticated encryption for stored records.
//!
//! Blob layouts:
//!
//! | Level      | Layout                                              |
//! |------------|-----------------------------------------------------|
//! | `standard` | `nonce(12) ‖ ciphertext ‖ tag(16)`                  |
//! | `high`     | `cost(8) ‖ salt(16) ‖ nonce(12) ‖ tag(16) ‖ ciphertext` |
//! | `extreme`  | `high` layout under the outer key, wrapping a `high` blob of the deflated plaintext |
//!
//! `cost` is the Argon2 time and memory cost (two big-endian `u32`) the key
//! was derived with, so records stay readable after the configured cost
//! changes. Every pass binds the caller's associated data (the record's
//! storage id).

use aes_gcm::{
    Aes256Gcm, Nonce, Tag,
    aead::{Aead, AeadInPlace, KeyInit, Payload},
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

use super::compression::{deflate, inflate};
use super::keys::{KEY_SIZE, KeyMaterial};
use super::{CryptoError, EncryptionLevel};
use crate::config::StorageConfig;

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Salt size for Argon2 key derivation
const SALT_SIZE: usize = 16;

/// AES-GCM authentication tag size
const TAG_SIZE: usize = 16;

/// Encoded Argon2 cost header size
const COST_SIZE: usize = 8;

/// Largest Argon2 memory cost written or read (1 GiB).
pub const MAX_MEMORY_KIB: u32 = 1024 * 1024;

/// Largest Argon2 time cost written or read.
pub const MAX_ITERATIONS: u32 = 64;

/// Largest configurable time cost; the `extreme` outer wrap adds one.
pub const MAX_CONFIGURED_ITERATIONS: u32 = MAX_ITERATIONS - 1;

const EXTREME_OUTER_LABEL: &[u8] = b"tessera/extreme-outer/v1";

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherParams {
    /// Argon2 time cost.
    pub iterations: u32,
    /// Argon2 memory cost in KiB.
    pub memory_kib: u32,
}

impl CipherParams {
    /// Parameters for the outer `extreme` wrap.
    #[must_use]
    fn outer(self) -> Self {
        Self {
            iterations: self.iterations.saturating_add(1),
            memory_kib: self.memory_kib,
        }
    }

    fn check(self) -> Result<Self, CryptoError> {
        if self.iterations > MAX_ITERATIONS || self.memory_kib > MAX_MEMORY_KIB {
            return Err(CryptoError::KeyDerivation(format!(
                "cost t={} m={} exceeds t={MAX_ITERATIONS} m={MAX_MEMORY_KIB}",
                self.iterations, self.memory_kib
            )));
        }
        Ok(self)
    }
}

impl From<&StorageConfig> for CipherParams {
    fn from(config: &StorageConfig) -> Self {
        Self {
            iterations: config.key_derivation_iterations,
            memory_kib: config.key_derivation_memory_kib,
        }
    }
}

/// Encrypts `plaintext` at `level` under `key`.
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` for rejected Argon2 parameters and
/// `CryptoError::Encrypt` if the AEAD pass fails.
pub fn seal(
    level: EncryptionLevel,
    key: &KeyMaterial,
    plaintext: &[u8],
    aad: &[u8],
    params: CipherParams,
) -> Result<Vec<u8>, CryptoError> {
    match level {
        EncryptionLevel::Standard => seal_direct(key.as_bytes(), plaintext, aad),
        EncryptionLevel::High => seal_derived(key.as_bytes(), plaintext, aad, params),
        EncryptionLevel::Extreme => {
            let compressed = deflate(plaintext)?;
            let inner = seal_derived(key.as_bytes(), &compressed, aad, params)?;
            let outer_key = key.derive_subkey(EXTREME_OUTER_LABEL)?;
            seal_derived(outer_key.as_bytes(), &inner, aad, params.outer())
        }
    }
}

/// Decrypts a blob produced by [`seal`] with the same level, key and
/// associated data.
///
/// # Errors
///
/// Returns `CryptoError::Decrypt` if any tag fails to verify and
/// `CryptoError::Malformed` if the blob does not fit its layout.
pub fn open(
    level: EncryptionLevel,
    key: &KeyMaterial,
    blob: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match level {
        EncryptionLevel::Standard => open_direct(key.as_bytes(), blob, aad),
        EncryptionLevel::High => open_derived(key.as_bytes(), blob, aad),
        EncryptionLevel::Extreme => {
            let outer_key = key.derive_subkey(EXTREME_OUTER_LABEL)?;
            let inner = open_derived(outer_key.as_bytes(), blob, aad)?;
            let compressed = open_derived(key.as_bytes(), &inner, aad)?;
            inflate(&compressed)
        }
    }
}

fn seal_direct(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encrypt)?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn open_direct(key: &[u8; KEY_SIZE], blob: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Malformed("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

fn seal_derived(
    password: &[u8; KEY_SIZE],
    plaintext: &[u8],
    aad: &[u8],
    params: CipherParams,
) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce_bytes);

    let params = params.check()?;
    let key = derive_key(password, &salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Encrypt)?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), aad, &mut buffer)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut blob =
        Vec::with_capacity(COST_SIZE + SALT_SIZE + NONCE_SIZE + TAG_SIZE + buffer.len());
    blob.extend_from_slice(&params.iterations.to_be_bytes());
    blob.extend_from_slice(&params.memory_kib.to_be_bytes());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&buffer);
    Ok(blob)
}

fn open_derived(
    password: &[u8; KEY_SIZE],
    blob: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < COST_SIZE + SALT_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Malformed("ciphertext too short".into()));
    }
    let (cost, rest) = blob.split_at(COST_SIZE);
    let params = decode_cost(cost)?;
    let (salt, rest) = rest.split_at(SALT_SIZE);
    let (nonce_bytes, rest) = rest.split_at(NONCE_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);

    let key = derive_key(password, salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::Decrypt)?;

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce_bytes),
            aad,
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(buffer)
}

fn decode_cost(cost: &[u8]) -> Result<CipherParams, CryptoError> {
    let (t, m) = cost.split_at(4);
    let iterations = u32::from_be_bytes(
        t.try_into()
            .map_err(|_| CryptoError::Malformed("bad cost header".into()))?,
    );
    let memory_kib = u32::from_be_bytes(
        m.try_into()
            .map_err(|_| CryptoError::Malformed("bad cost header".into()))?,
    );
    if iterations > MAX_ITERATIONS || memory_kib > MAX_MEMORY_KIB {
        return Err(CryptoError::Malformed("cost header out of range".into()));
    }
    Ok(CipherParams {
        iterations,
        memory_kib,
    })
}

fn derive_key(
    password: &[u8],
    salt: &[u8],
    params: CipherParams,
) -> Result<[u8; KEY_SIZE], CryptoError> {
    let params = Params::new(params.memory_kib, params.iterations, 1, Some(KEY_SIZE))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}
