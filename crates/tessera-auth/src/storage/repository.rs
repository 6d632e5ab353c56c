//! Token record persistence trait.
//!
//! The repository stores [`EncryptedTokenRecord`]s and two small lookup
//! tables: a token-hash index (hash of a `jti` or opaque token value to
//! storage id) and an association table (refresh token record to the access
//! token record it was issued with). Implementations never see plaintext.

use async_trait::async_trait;
use time::OffsetDateTime;

use super::record::EncryptedTokenRecord;
use crate::AuthResult;

/// Storage backend for encrypted token records.
///
/// Implementations must be thread-safe (`Send + Sync`) so a single store can
/// be shared across request handlers and background rotation.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns an error if a record with the same storage id exists or the
    /// backend fails.
    async fn insert(&self, record: &EncryptedTokenRecord) -> AuthResult<()>;

    /// Finds a record by storage id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn find(&self, storage_id: &str) -> AuthResult<Option<EncryptedTokenRecord>>;

    /// Replaces a record only if its stored revision equals
    /// `expected_revision`.
    ///
    /// The caller sets `record.revision` to the new value. Returns `false`
    /// when the record is missing or another writer got there first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn replace_if_revision(
        &self,
        record: &EncryptedTokenRecord,
        expected_revision: u64,
    ) -> AuthResult<bool>;

    /// Bumps the access counter and last access time.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails. A missing record is not an error.
    async fn record_access(&self, storage_id: &str, at: OffsetDateTime) -> AuthResult<()>;

    /// Deletes a record along with its index and association entries.
    ///
    /// # Returns
    ///
    /// `true` if a record was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn delete(&self, storage_id: &str) -> AuthResult<bool>;

    /// Lists records not encrypted under `target_version`, ordered by
    /// storage id and starting strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn list_stale(
        &self,
        target_version: u32,
        after: Option<&str>,
        limit: usize,
    ) -> AuthResult<Vec<EncryptedTokenRecord>>;

    /// Counts records encrypted under `key_version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn count_by_key_version(&self, key_version: u32) -> AuthResult<u64>;

    /// Deletes every record whose `expires_at` is at or before `now`.
    ///
    /// # Returns
    ///
    /// The number of records deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn delete_expired(&self, now: OffsetDateTime) -> AuthResult<u64>;

    /// Maps a token hash to a storage id.
    ///
    /// # Errors
    ///
    /// Returns an error if the hash is already indexed or the backend fails.
    async fn index_token(&self, token_hash: &str, storage_id: &str) -> AuthResult<()>;

    /// Resolves a token hash to its storage id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn find_by_token_hash(&self, token_hash: &str) -> AuthResult<Option<String>>;

    /// Links one record to another, replacing any existing link from `from`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn associate(&self, from: &str, to: &str) -> AuthResult<()>;

    /// Returns the record `from` is linked to.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn find_association(&self, from: &str) -> AuthResult<Option<String>>;
}
