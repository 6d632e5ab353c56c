//! Encrypted token store.
//!
//! Persists [`TokenPayload`]s as authenticated ciphertext behind a
//! [`TokenRepository`]. The write path is serialize, encrypt at the chosen
//! [`EncryptionLevel`], optionally deflate, then MAC the whole record. The
//! read path checks the MAC before anything is decrypted.
//!
//! Record rewrites (revocation, key rotation) are compare-and-swap on the
//! record's `revision`, so concurrent writers never interleave a half-written
//! record. Access counters are bumped separately and are not covered by the
//! MAC.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use uuid::Uuid;

use super::record::{EncryptedTokenRecord, RetrieveOutcome, StoredToken, TokenPayload, truncate};
use super::repository::TokenRepository;
use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::crypto::compression::{compress_if_smaller, inflate};
use crate::crypto::{CipherParams, CryptoError, EncryptionLevel, KeyManager, KeyVersion, cipher};
use crate::token::RevocationReason;
use crate::types::hash_token;
use crate::{AuthError, AuthResult};

/// Attempts per record before a contended rewrite gives up.
const MAX_CAS_ATTEMPTS: usize = 5;

// =============================================================================
// Rotation Report
// =============================================================================

/// Summary of a [`EncryptedTokenStore::rotate_keys`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    /// Key version every migrated record now uses.
    pub new_version: u32,
    /// `true` if an interrupted rotation was finished instead of minting a
    /// new key.
    pub resumed: bool,
    /// Records re-encrypted by this run.
    pub migrated: u64,
    /// Storage ids left on their old version.
    pub failed: Vec<String>,
    /// Retired versions whose key material was dropped.
    pub purged_versions: Vec<u32>,
}

impl RotationReport {
    /// Returns `true` if no record was left behind.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Encrypted persistence for token records.
pub struct EncryptedTokenStore {
    repository: Arc<dyn TokenRepository>,
    keys: Arc<KeyManager>,
    clock: Arc<dyn Clock>,
    config: StorageConfig,
}

impl EncryptedTokenStore {
    /// Creates a store over `repository` using keys from `keys`.
    #[must_use]
    pub fn new(
        repository: Arc<dyn TokenRepository>,
        keys: Arc<KeyManager>,
        config: StorageConfig,
    ) -> Self {
        Self {
            repository,
            keys,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Sets the clock used for expiry and timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Level applied when the caller has no preference.
    #[must_use]
    pub fn default_level(&self) -> EncryptionLevel {
        self.config.encryption_level
    }

    #[must_use]
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Encrypts and persists a payload.
    ///
    /// The payload is indexed by the hash of its `token_id`. If indexing
    /// fails the record is removed again, so no record exists that cannot be
    /// found.
    ///
    /// # Returns
    ///
    /// The new record's storage id.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or any repository write fails.
    pub async fn store(&self, payload: &TokenPayload, level: EncryptionLevel) -> AuthResult<String> {
        let _lease = self.keys.lease().await;
        let key = self.keys.current();
        let record = EncryptedTokenRecord {
            storage_id: Uuid::new_v4().to_string(),
            token_type: payload.token_type,
            client_id: payload.client_id.clone(),
            user_id: payload.user_id.clone(),
            encrypted_data: String::new(),
            encryption_level: level,
            key_version: key.version,
            is_compressed: false,
            compression_ratio: 1.0,
            integrity_hash: String::new(),
            expires_at: truncate(payload.expires_at),
            created_at: truncate(self.clock.now()),
            is_revoked: false,
            revoked_at: None,
            revocation_reason: None,
            access_count: 0,
            last_accessed_at: None,
            revision: 0,
        };
        let record = self.seal_into(record, payload, &key).await?;
        self.repository.insert(&record).await?;

        if let Err(e) = self
            .repository
            .index_token(&hash_token(&payload.token_id), &record.storage_id)
            .await
        {
            self.repository.delete(&record.storage_id).await?;
            return Err(e);
        }

        tracing::debug!(
            storage_id = %record.storage_id,
            client_id = %record.client_id,
            token_type = %record.token_type,
            level = %level,
            key_version = record.key_version,
            "Stored token record"
        );
        Ok(record.storage_id)
    }

    /// Reads and decrypts a record.
    ///
    /// The integrity hash is checked before decryption. Expired records are
    /// reported as [`RetrieveOutcome::Expired`] and, if configured, deleted.
    /// A successful read bumps the access counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails, or
    /// `AuthError::CryptographicFailure` if a record with a valid integrity
    /// hash does not decrypt.
    pub async fn retrieve(&self, storage_id: &str) -> AuthResult<RetrieveOutcome> {
        let _lease = self.keys.lease().await;
        let Some(record) = self.repository.find(storage_id).await? else {
            return Ok(RetrieveOutcome::NotFound);
        };
        let Some(key) = self.verified_key(&record)? else {
            return Ok(RetrieveOutcome::IntegrityFailure);
        };

        let now = self.clock.now();
        if record.is_expired(now) {
            tracing::debug!(storage_id = %storage_id, "Token record expired");
            if self.config.evict_expired_on_read {
                self.repository.delete(storage_id).await?;
            }
            return Ok(RetrieveOutcome::Expired);
        }

        let payload = self.decrypt(&record, &key).await?;
        self.repository.record_access(storage_id, now).await?;

        let mut record = record;
        record.access_count = record.access_count.saturating_add(1);
        record.last_accessed_at = Some(now);
        Ok(RetrieveOutcome::Found(StoredToken { record, payload }))
    }

    /// Marks a record revoked.
    ///
    /// The payload is re-encrypted with the revocation recorded and the
    /// record is rewritten in place. Revoking an already revoked record
    /// succeeds without changing it.
    ///
    /// # Returns
    ///
    /// `false` if the record does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::IntegrityFailure` for a tampered record and
    /// `AuthError::Storage` if the rewrite keeps losing to other writers.
    pub async fn revoke(&self, storage_id: &str, reason: RevocationReason) -> AuthResult<bool> {
        let _lease = self.keys.lease().await;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(record) = self.repository.find(storage_id).await? else {
                return Ok(false);
            };
            if record.is_revoked {
                return Ok(true);
            }
            let Some(key) = self.verified_key(&record)? else {
                return Err(AuthError::integrity(storage_id));
            };

            let mut payload = self.decrypt(&record, &key).await?;
            payload.revoked = true;
            payload.revocation_reason = Some(reason.as_str().to_string());

            let mut next = record.clone();
            next.revoked_at = Some(truncate(self.clock.now()));
            next.revision = record.revision + 1;
            let next = self.seal_into(next, &payload, &self.keys.current()).await?;

            if self
                .repository
                .replace_if_revision(&next, record.revision)
                .await?
            {
                tracing::info!(
                    storage_id = %storage_id,
                    client_id = %record.client_id,
                    reason = reason.as_str(),
                    "Token record revoked"
                );
                return Ok(true);
            }
        }
        Err(AuthError::storage(format!(
            "record {storage_id} kept changing during revocation"
        )))
    }

    /// Re-encrypts every record under the newest key version.
    ///
    /// If a version was activated and no migration pass has completed since
    /// (an earlier run was interrupted, or the key was rotated directly) the
    /// current key is reused and the report says `resumed`; otherwise a new
    /// version is activated first. Records that fail integrity do not count
    /// as unfinished work, so the next run still advances the key. Records
    /// are migrated one at a time with compare-and-swap, so cancelling
    /// leaves each record on either its old or its new version. Versions no
    /// record references afterwards are purged once in-flight writes drain.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::KeyRotationInProgress` if another rotation is
    /// running, or an error if key generation or a repository read fails.
    pub async fn rotate_keys(&self) -> AuthResult<RotationReport> {
        let guard = self.keys.try_begin_rotation()?;

        let resumed = self.keys.migration_pending();
        let target = if resumed {
            self.keys.current()
        } else {
            self.keys.advance(&guard).await?
        };

        tracing::info!(
            key_version = target.version,
            resumed,
            "Starting key rotation"
        );

        let batch_size = self.config.rotation_batch_size.max(1);
        let mut after: Option<String> = None;
        let mut migrated = 0u64;
        let mut failed = Vec::new();

        loop {
            let page = self
                .repository
                .list_stale(target.version, after.as_deref(), batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.storage_id.clone());

            for record in page {
                let storage_id = record.storage_id.clone();
                match self.migrate(record, &target).await {
                    Ok(true) => migrated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(
                            storage_id = %storage_id,
                            failure = e.reason_code(),
                            "Token record not migrated"
                        );
                        failed.push(storage_id);
                    }
                }
            }
        }

        self.keys.finish_migration(&guard);

        let pause = self.keys.pause_leases(&guard).await;
        let mut purged_versions = Vec::new();
        let retired: Vec<u32> = self
            .keys
            .snapshot()
            .versions()
            .map(|v| v.version)
            .filter(|v| *v != target.version)
            .collect();
        for version in retired {
            if self.repository.count_by_key_version(version).await? == 0
                && self.keys.purge(version)?
            {
                purged_versions.push(version);
            }
        }
        drop(pause);
        drop(guard);

        let report = RotationReport {
            new_version: target.version,
            resumed,
            migrated,
            failed,
            purged_versions,
        };
        tracing::info!(
            key_version = report.new_version,
            resumed = report.resumed,
            migrated = report.migrated,
            failed = report.failed.len(),
            purged = ?report.purged_versions,
            "Key rotation finished"
        );
        Ok(report)
    }

    /// Deletes every expired record.
    ///
    /// # Returns
    ///
    /// The number of records deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn cleanup_expired(&self) -> AuthResult<u64> {
        let deleted = self.repository.delete_expired(self.clock.now()).await?;
        tracing::info!(deleted, "Expired token records cleaned up");
        Ok(deleted)
    }

    /// Resolves a token id (`jti` or opaque token hash) to its storage id.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn find_storage_id(&self, token_id: &str) -> AuthResult<Option<String>> {
        self.repository.find_by_token_hash(&hash_token(token_id)).await
    }

    /// Links a record to a paired record.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn associate(&self, from: &str, to: &str) -> AuthResult<()> {
        self.repository.associate(from, to).await
    }

    /// Returns the record paired with `from`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn find_association(&self, from: &str) -> AuthResult<Option<String>> {
        self.repository.find_association(from).await
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Resolves the record's key version and checks the integrity hash.
    ///
    /// `None` means the record must not be trusted.
    fn verified_key(&self, record: &EncryptedTokenRecord) -> AuthResult<Option<Arc<KeyVersion>>> {
        let Some(key) = self.keys.get(record.key_version) else {
            tracing::warn!(
                storage_id = %record.storage_id,
                key_version = record.key_version,
                failure = "unknown_key_version",
                "Rejected token record"
            );
            return Ok(None);
        };
        if !record.verify_integrity(&key.material)? {
            tracing::warn!(
                storage_id = %record.storage_id,
                failure = "integrity",
                "Rejected token record"
            );
            return Ok(None);
        }
        Ok(Some(key))
    }

    /// Moves one record to `target`, retrying on contention.
    ///
    /// Returns `false` if the record vanished or already uses `target`.
    async fn migrate(&self, record: EncryptedTokenRecord, target: &Arc<KeyVersion>) -> AuthResult<bool> {
        let mut record = record;
        for _ in 0..MAX_CAS_ATTEMPTS {
            if record.key_version == target.version {
                return Ok(false);
            }
            let Some(key) = self.verified_key(&record)? else {
                return Err(AuthError::integrity(&record.storage_id));
            };
            let payload = self.decrypt(&record, &key).await?;

            let mut next = record.clone();
            next.revision = record.revision + 1;
            let next = self.seal_into(next, &payload, target).await?;

            if self
                .repository
                .replace_if_revision(&next, record.revision)
                .await?
            {
                return Ok(true);
            }
            match self.repository.find(&record.storage_id).await? {
                Some(current) => record = current,
                None => return Ok(false),
            }
        }
        Err(AuthError::storage(format!(
            "record {} kept changing during rotation",
            record.storage_id
        )))
    }

    /// Encrypts `payload` into `record` under `key` and recomputes the MAC.
    async fn seal_into(
        &self,
        mut record: EncryptedTokenRecord,
        payload: &TokenPayload,
        key: &KeyVersion,
    ) -> AuthResult<EncryptedTokenRecord> {
        let plaintext = serde_json::to_vec(payload)
            .map_err(|e| AuthError::internal(format!("failed to serialize token payload: {e}")))?;
        let material = key.material.clone();
        let aad = record.storage_id.clone();
        let level = record.encryption_level;
        let params = CipherParams::from(&self.config);
        let compress = self.config.compress_payloads;

        let (stored, is_compressed, ratio) = tokio::task::spawn_blocking(move || {
            let blob = cipher::seal(level, &material, &plaintext, aad.as_bytes(), params)?;
            if compress {
                compress_if_smaller(blob)
            } else {
                Ok((blob, false, 1.0))
            }
        })
        .await
        .map_err(|e| AuthError::internal(format!("encryption task failed: {e}")))??;

        record.encrypted_data = STANDARD.encode(stored);
        record.key_version = key.version;
        record.is_compressed = is_compressed;
        record.compression_ratio = ratio;
        record.is_revoked = payload.revoked;
        record.revocation_reason = payload.revocation_reason.clone();
        if !record.is_revoked {
            record.revoked_at = None;
        }
        record.seal_integrity(&key.material)?;
        Ok(record)
    }

    /// Decrypts a record whose integrity has been verified.
    async fn decrypt(&self, record: &EncryptedTokenRecord, key: &KeyVersion) -> AuthResult<TokenPayload> {
        let storage_id = record.storage_id.clone();
        let material = key.material.clone();
        let level = record.encryption_level;
        let compressed = record.is_compressed;
        let encoded = record.encrypted_data.clone();

        let opened = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, CryptoError> {
            let blob = STANDARD
                .decode(encoded)
                .map_err(|_| CryptoError::Malformed("ciphertext is not base64".into()))?;
            let blob = if compressed { inflate(&blob)? } else { blob };
            cipher::open(level, &material, &blob, storage_id.as_bytes())
        })
        .await
        .map_err(|e| AuthError::internal(format!("decryption task failed: {e}")))?;

        let plaintext = match opened {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(
                    storage_id = %record.storage_id,
                    failure = %e,
                    "Token record failed to decrypt"
                );
                return Err(e.into());
            }
        };
        serde_json::from_slice(&plaintext).map_err(|_| {
            tracing::warn!(
                storage_id = %record.storage_id,
                failure = "payload_decode",
                "Token record failed to decode"
            );
            AuthError::cryptographic("decrypted payload is not a token record")
        })
    }
}

impl std::fmt::Debug for EncryptedTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedTokenStore")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
