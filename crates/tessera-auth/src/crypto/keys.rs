//! Versioned master keys.
//!
//! The [`KeyManager`] publishes an immutable [`KeyRing`] snapshot through
//! `arc-swap`. Readers load a snapshot without locking and keep using the
//! `Arc<KeyVersion>` they resolved even if a rotation publishes a newer ring
//! in the meantime. Rotation is single-writer: the caller must hold a
//! [`RotationGuard`] to add a version.
//!
//! Anything that encrypts or decrypts a stored record holds a [`KeyLease`]
//! from resolving its key until the record is written or read. Purging a
//! version waits for every outstanding lease, so a record can never land
//! under key material that has already been dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::CryptoError;
use crate::clock::{Clock, SystemClock};
use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Key size for AES-256 (256 bits)
pub const KEY_SIZE: usize = 32;

// =============================================================================
// Key Material
// =============================================================================

/// 256 bits of secret key material.
///
/// `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; KEY_SIZE]);

impl KeyMaterial {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generates fresh key material from the thread RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Parses a key from a hex or base64 string.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the string is neither a 64-digit
    /// hex value nor base64 decoding to 32 bytes.
    pub fn parse(encoded: &str) -> Result<Self, CryptoError> {
        let encoded = encoded.trim();

        if encoded.len() == KEY_SIZE * 2
            && let Ok(bytes) = hex::decode(encoded)
        {
            return Self::from_slice(&bytes);
        }

        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid base64 key: {e}")))?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Derives a domain-separated subkey with HMAC-SHA256.
    pub fn derive_subkey(&self, label: &[u8]) -> Result<KeyMaterial, CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        mac.update(label);
        Ok(Self(mac.finalize().into_bytes().into()))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

// =============================================================================
// Key Versions
// =============================================================================

/// Lifecycle state of a key version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Encrypts new records.
    Active,
    /// Decrypts records not yet migrated.
    Retired,
}

/// One version of the master key.
#[derive(Debug, Clone)]
pub struct KeyVersion {
    /// Monotonic version number.
    pub version: u32,
    /// When this version was created.
    pub created_at: OffsetDateTime,
    /// Whether this version encrypts new records.
    pub status: KeyStatus,
    /// Secret key material.
    pub material: KeyMaterial,
}

impl KeyVersion {
    /// Returns `true` if this version encrypts new records.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }

    fn retired(&self) -> Self {
        Self {
            status: KeyStatus::Retired,
            ..self.clone()
        }
    }
}

/// An immutable snapshot of every loaded key version.
#[derive(Debug, Clone)]
pub struct KeyRing {
    versions: BTreeMap<u32, Arc<KeyVersion>>,
    active: u32,
}

impl KeyRing {
    fn from_versions(versions: Vec<KeyVersion>) -> Result<Self, CryptoError> {
        let mut active = None;
        let mut map = BTreeMap::new();

        for version in versions {
            if version.is_active() {
                if active.is_some() {
                    return Err(CryptoError::InvalidKey(
                        "more than one active key version".into(),
                    ));
                }
                active = Some(version.version);
            }
            if map.insert(version.version, Arc::new(version)).is_some() {
                return Err(CryptoError::InvalidKey("duplicate key version".into()));
            }
        }

        let active =
            active.ok_or_else(|| CryptoError::InvalidKey("no active key version".into()))?;
        Ok(Self {
            versions: map,
            active,
        })
    }

    /// Returns the active key version.
    #[must_use]
    pub fn current(&self) -> &Arc<KeyVersion> {
        // The constructor and every mutation keep `active` present.
        &self.versions[&self.active]
    }

    /// Returns the version number of the active key.
    #[must_use]
    pub fn active_version(&self) -> u32 {
        self.active
    }

    /// Looks up a key version.
    #[must_use]
    pub fn get(&self, version: u32) -> Option<&Arc<KeyVersion>> {
        self.versions.get(&version)
    }

    /// Iterates all loaded versions in ascending order.
    pub fn versions(&self) -> impl Iterator<Item = &Arc<KeyVersion>> {
        self.versions.values()
    }

    fn with_new_active(&self, material: KeyMaterial, created_at: OffsetDateTime) -> Self {
        let next = self.versions.keys().next_back().copied().unwrap_or(0) + 1;
        let mut versions: BTreeMap<u32, Arc<KeyVersion>> = self
            .versions
            .iter()
            .map(|(v, key)| {
                let key = if key.is_active() {
                    Arc::new(key.retired())
                } else {
                    Arc::clone(key)
                };
                (*v, key)
            })
            .collect();
        versions.insert(
            next,
            Arc::new(KeyVersion {
                version: next,
                created_at,
                status: KeyStatus::Active,
                material,
            }),
        );
        Self {
            versions,
            active: next,
        }
    }

    fn without(&self, version: u32) -> Self {
        let mut versions = self.versions.clone();
        versions.remove(&version);
        Self {
            versions,
            active: self.active,
        }
    }
}

// =============================================================================
// Key Provider
// =============================================================================

/// Source of new key material.
///
/// Implement this to delegate key generation to an external KMS.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Generates material for a new key version.
    async fn generate(&self) -> Result<KeyMaterial, CryptoError>;
}

/// Generates keys from the operating system RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalKeyProvider;

#[async_trait]
impl KeyProvider for LocalKeyProvider {
    async fn generate(&self) -> Result<KeyMaterial, CryptoError> {
        let mut key = [0u8; KEY_SIZE];
        rand::rngs::OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| CryptoError::InvalidKey(format!("OS RNG failed: {e}")))?;
        Ok(KeyMaterial::from_bytes(key))
    }
}

// =============================================================================
// Key Manager
// =============================================================================

/// Proof that the holder is the single rotation writer.
pub struct RotationGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Keeps retired versions from being purged while held.
pub struct KeyLease<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Excludes every [`KeyLease`] while held.
#[derive(Debug)]
pub struct LeasePause<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

/// Holds the versioned master keys and serializes rotation.
pub struct KeyManager {
    ring: ArcSwap<KeyRing>,
    rotation: Mutex<()>,
    leases: RwLock<()>,
    /// Set when a version is activated, cleared once records were migrated.
    migration_pending: AtomicBool,
    provider: Arc<dyn KeyProvider>,
    clock: Arc<dyn Clock>,
}

impl KeyManager {
    /// Creates a manager with a single active key as version 1.
    #[must_use]
    pub fn new(material: KeyMaterial) -> Self {
        let ring = KeyRing {
            versions: BTreeMap::from([(
                1,
                Arc::new(KeyVersion {
                    version: 1,
                    created_at: OffsetDateTime::now_utc(),
                    status: KeyStatus::Active,
                    material,
                }),
            )]),
            active: 1,
        };
        Self::from_ring(ring)
    }

    /// Creates a manager with a freshly generated key.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(KeyMaterial::generate())
    }

    /// Creates a manager from a hex or base64 encoded master key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the key cannot be parsed.
    pub fn from_master_key(encoded: &str) -> Result<Self, CryptoError> {
        Ok(Self::new(KeyMaterial::parse(encoded)?))
    }

    /// Creates a manager from the master key in environment variable `var`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the variable is unset or invalid.
    pub fn from_env(var: &str) -> Result<Self, CryptoError> {
        let value = std::env::var(var)
            .map_err(|e| CryptoError::InvalidKey(format!("failed to read {var}: {e}")))?;
        Self::from_master_key(&value)
    }

    /// Restores a manager from persisted key versions.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` unless exactly one version is active
    /// and version numbers are unique.
    pub fn from_versions(versions: Vec<KeyVersion>) -> Result<Self, CryptoError> {
        Ok(Self::from_ring(KeyRing::from_versions(versions)?))
    }

    fn from_ring(ring: KeyRing) -> Self {
        Self {
            ring: ArcSwap::from_pointee(ring),
            rotation: Mutex::new(()),
            leases: RwLock::new(()),
            migration_pending: AtomicBool::new(false),
            provider: Arc::new(LocalKeyProvider),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the provider used to generate new versions.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Sets the clock used to stamp new versions.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the current key ring snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<KeyRing> {
        self.ring.load_full()
    }

    /// Returns the active key version.
    #[must_use]
    pub fn current(&self) -> Arc<KeyVersion> {
        Arc::clone(self.ring.load().current())
    }

    /// Looks up a key version in the current snapshot.
    #[must_use]
    pub fn get(&self, version: u32) -> Option<Arc<KeyVersion>> {
        self.ring.load().get(version).cloned()
    }

    /// Resolves a key version or fails with `UnknownKeyVersion`.
    pub fn require(&self, version: u32) -> Result<Arc<KeyVersion>, CryptoError> {
        self.get(version)
            .ok_or(CryptoError::UnknownKeyVersion(version))
    }

    /// Becomes the rotation writer without waiting.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::KeyRotationInProgress` if another rotation holds
    /// the lock.
    pub fn try_begin_rotation(&self) -> Result<RotationGuard<'_>, AuthError> {
        self.rotation
            .try_lock()
            .map(|guard| RotationGuard { _guard: guard })
            .map_err(|_| AuthError::KeyRotationInProgress)
    }

    /// Adds a new active version, retiring the previous one.
    ///
    /// # Errors
    ///
    /// Returns any error from the key provider.
    pub async fn advance(&self, _guard: &RotationGuard<'_>) -> Result<Arc<KeyVersion>, CryptoError> {
        let material = self.provider.generate().await?;
        let created_at = self.clock.now();
        self.ring
            .rcu(|ring| ring.with_new_active(material.clone(), created_at));

        self.migration_pending.store(true, Ordering::Release);

        let current = self.current();
        tracing::info!(key_version = current.version, "Activated new key version");
        Ok(current)
    }

    /// Returns `true` if a version was activated and no migration pass has
    /// completed since.
    #[must_use]
    pub fn migration_pending(&self) -> bool {
        self.migration_pending.load(Ordering::Acquire)
    }

    /// Records that every migratable record now uses the active version.
    pub fn finish_migration(&self, _guard: &RotationGuard<'_>) {
        self.migration_pending.store(false, Ordering::Release);
    }

    /// Takes a lease that holds off purges until dropped.
    ///
    /// Resolve keys only after taking the lease.
    pub async fn lease(&self) -> KeyLease<'_> {
        KeyLease {
            _guard: self.leases.read().await,
        }
    }

    /// Waits for every outstanding lease and blocks new ones until dropped.
    pub async fn pause_leases(&self, _guard: &RotationGuard<'_>) -> LeasePause<'_> {
        LeasePause {
            _guard: self.leases.write().await,
        }
    }

    /// Waits for the rotation lock and adds a new active version.
    ///
    /// # Errors
    ///
    /// Returns any error from the key provider.
    pub async fn rotate(&self) -> Result<Arc<KeyVersion>, CryptoError> {
        let guard = RotationGuard {
            _guard: self.rotation.lock().await,
        };
        self.advance(&guard).await
    }

    /// Drops a retired version's key material.
    ///
    /// Returns `false` if the version was not loaded. Callers must ensure no
    /// record still references the version, which with concurrent writers
    /// means counting records while holding [`KeyManager::pause_leases`].
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::ActiveKeyPurge` for the active version.
    pub fn purge(&self, version: u32) -> Result<bool, CryptoError> {
        let ring = self.ring.load();
        if ring.active_version() == version {
            return Err(CryptoError::ActiveKeyPurge(version));
        }
        if ring.get(version).is_none() {
            return Ok(false);
        }

        self.ring.rcu(|ring| {
            if ring.active_version() == version {
                KeyRing::clone(ring)
            } else {
                ring.without(version)
            }
        });
        tracing::info!(key_version = version, "Purged retired key version");
        Ok(self.get(version).is_none())
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.load();
        f.debug_struct("KeyManager")
            .field("active_version", &ring.active_version())
            .field("versions", &ring.versions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, block_on, task};

    #[test]
    fn test_parse_hex_and_base64() {
        let raw = [7u8; KEY_SIZE];
        let from_hex = KeyMaterial::parse(&hex::encode(raw)).unwrap();
        let from_b64 = KeyMaterial::parse(&BASE64.encode(raw)).unwrap();
        assert_eq!(from_hex, from_b64);
        assert_eq!(from_hex.as_bytes(), &raw);
    }

    #[test]
    fn test_parse_rejects_short_key() {
        let err = KeyMaterial::parse(&BASE64.encode([1u8; 16])).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey(_)));
        assert!(KeyMaterial::parse("not a key!").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = KeyMaterial::from_bytes([0xab; KEY_SIZE]);
        let debug = format!("{key:?}");
        assert!(!debug.contains("ab"));
        assert!(debug.contains("REDACTED"));

        let manager = KeyManager::new(key);
        assert!(!format!("{manager:?}").contains("171"));
    }

    #[test]
    fn test_subkeys_are_domain_separated() {
        let key = KeyMaterial::generate();
        let a = key.derive_subkey(b"a").unwrap();
        assert_ne!(a, key.derive_subkey(b"b").unwrap());
        assert_eq!(a, key.derive_subkey(b"a").unwrap());
        assert_ne!(a, key);
    }

    #[tokio::test]
    async fn test_rotate_retires_previous_version() {
        let manager = KeyManager::generate();
        let first = manager.current();
        assert_eq!(first.version, 1);

        let second = manager.rotate().await.unwrap();
        assert_eq!(second.version, 2);
        assert!(second.is_active());
        assert_eq!(manager.current().version, 2);

        let retired = manager.get(1).unwrap();
        assert_eq!(retired.status, KeyStatus::Retired);
        assert_eq!(retired.material, first.material);

        // A stale reader keeps its resolved version.
        assert!(first.is_active());
    }

    #[tokio::test]
    async fn test_only_one_rotation_writer() {
        let manager = KeyManager::generate();
        let guard = manager.try_begin_rotation().unwrap();
        let err = manager.try_begin_rotation().err().unwrap();
        assert!(matches!(err, AuthError::KeyRotationInProgress));

        manager.advance(&guard).await.unwrap();
        drop(guard);
        assert!(manager.try_begin_rotation().is_ok());
    }

    #[tokio::test]
    async fn test_purge() {
        let manager = KeyManager::generate();
        manager.rotate().await.unwrap();

        let err = manager.purge(2).unwrap_err();
        assert!(matches!(err, CryptoError::ActiveKeyPurge(2)));

        assert!(manager.purge(1).unwrap());
        assert!(manager.get(1).is_none());
        assert!(!manager.purge(1).unwrap());
        assert!(matches!(
            manager.require(1),
            Err(CryptoError::UnknownKeyVersion(1))
        ));
    }

    #[test]
    fn test_from_versions_requires_one_active() {
        let version = |v, status| KeyVersion {
            version: v,
            created_at: OffsetDateTime::now_utc(),
            status,
            material: KeyMaterial::generate(),
        };

        let manager = KeyManager::from_versions(vec![
            version(1, KeyStatus::Retired),
            version(2, KeyStatus::Active),
        ])
        .unwrap();
        assert_eq!(manager.current().version, 2);
        assert_eq!(manager.snapshot().versions().count(), 2);

        assert!(KeyManager::from_versions(vec![version(1, KeyStatus::Retired)]).is_err());
        assert!(
            KeyManager::from_versions(vec![
                version(1, KeyStatus::Active),
                version(2, KeyStatus::Active),
            ])
            .is_err()
        );
    }

    #[test]
    fn test_from_env() {
        let var = "TESSERA_TEST_MASTER_KEY_FROM_ENV";
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var(var, hex::encode([3u8; KEY_SIZE])) };
        let manager = KeyManager::from_env(var).unwrap();
        assert_eq!(manager.current().material.as_bytes(), &[3u8; KEY_SIZE]);

        assert!(KeyManager::from_env("TESSERA_TEST_UNSET_VARIABLE").is_err());
    }

    #[tokio::test]
    async fn test_local_provider_generates_distinct_keys() {
        let provider = LocalKeyProvider;
        let a = provider.generate().await.unwrap();
        let b = provider.generate().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_migration_pending_follows_activation() {
        let manager = KeyManager::generate();
        assert!(!manager.migration_pending());

        manager.rotate().await.unwrap();
        assert!(manager.migration_pending());

        let guard = manager.try_begin_rotation().unwrap();
        manager.finish_migration(&guard);
        assert!(!manager.migration_pending());
    }

    #[test]
    fn test_pause_waits_for_leases() {
        let manager = KeyManager::generate();
        let lease = block_on(manager.lease());
        let guard = manager.try_begin_rotation().unwrap();

        let mut pause = task::spawn(manager.pause_leases(&guard));
        assert_pending!(pause.poll());

        drop(lease);
        assert!(pause.is_woken());
        let _pause = assert_ready!(pause.poll());
    }
}
