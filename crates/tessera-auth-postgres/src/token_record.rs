//! Encrypted token record storage for PostgreSQL.
//!
//! Implements [`TokenRepository`] over three tables. Rows hold ciphertext
//! only; decryption and integrity checks happen in the store above.
//!
//! Index and association rows reference `encrypted_token` with
//! `ON DELETE CASCADE`, so deleting a record removes its links.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::pool::PoolOptions;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_core::row::Row;
use sqlx_postgres::{PgRow, Postgres};
use time::OffsetDateTime;

use tessera_auth::AuthResult;
use tessera_auth::crypto::EncryptionLevel;
use tessera_auth::storage::{EncryptedTokenRecord, TokenRepository, TokenType};

use crate::{PgPool, StorageError, StorageResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS encrypted_token (
        storage_id TEXT PRIMARY KEY,
        token_type TEXT NOT NULL,
        client_id TEXT NOT NULL,
        user_id TEXT,
        encrypted_data TEXT NOT NULL,
        encryption_level TEXT NOT NULL,
        key_version BIGINT NOT NULL,
        is_compressed BOOLEAN NOT NULL DEFAULT FALSE,
        compression_ratio DOUBLE PRECISION NOT NULL DEFAULT 1.0,
        integrity_hash TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        is_revoked BOOLEAN NOT NULL DEFAULT FALSE,
        revoked_at TIMESTAMPTZ,
        revocation_reason TEXT,
        access_count BIGINT NOT NULL DEFAULT 0,
        last_accessed_at TIMESTAMPTZ,
        revision BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS encrypted_token_key_version_idx \
     ON encrypted_token (key_version, storage_id)",
    "CREATE INDEX IF NOT EXISTS encrypted_token_expires_at_idx ON encrypted_token (expires_at)",
    "CREATE INDEX IF NOT EXISTS encrypted_token_client_id_idx ON encrypted_token (client_id)",
    r#"
    CREATE TABLE IF NOT EXISTS token_index (
        token_hash TEXT PRIMARY KEY,
        storage_id TEXT NOT NULL REFERENCES encrypted_token (storage_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS token_association (
        from_storage_id TEXT PRIMARY KEY
            REFERENCES encrypted_token (storage_id) ON DELETE CASCADE,
        to_storage_id TEXT NOT NULL
            REFERENCES encrypted_token (storage_id) ON DELETE CASCADE
    )
    "#,
];

const RECORD_COLUMNS: &str = "storage_id, token_type, client_id, user_id, encrypted_data, \
     encryption_level, key_version, is_compressed, compression_ratio, integrity_hash, \
     expires_at, created_at, is_revoked, revoked_at, revocation_reason, access_count, \
     last_accessed_at, revision";

// =============================================================================
// Row Conversion
// =============================================================================

fn to_i64(value: u64, column: &str) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::invalid_data(format!("{column} out of range: {value}")))
}

fn to_u64(value: i64, column: &str) -> StorageResult<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::invalid_data(format!("{column} out of range: {value}")))
}

fn record_from_row(row: &PgRow) -> StorageResult<EncryptedTokenRecord> {
    let token_type: String = row.try_get("token_type")?;
    let token_type = token_type
        .parse::<TokenType>()
        .map_err(StorageError::invalid_data)?;

    let encryption_level: String = row.try_get("encryption_level")?;
    let encryption_level = encryption_level
        .parse::<EncryptionLevel>()
        .map_err(|e| StorageError::invalid_data(e.to_string()))?;

    let key_version: i64 = row.try_get("key_version")?;
    let key_version = u32::try_from(key_version).map_err(|_| {
        StorageError::invalid_data(format!("key_version out of range: {key_version}"))
    })?;

    Ok(EncryptedTokenRecord {
        storage_id: row.try_get("storage_id")?,
        token_type,
        client_id: row.try_get("client_id")?,
        user_id: row.try_get("user_id")?,
        encrypted_data: row.try_get("encrypted_data")?,
        encryption_level,
        key_version,
        is_compressed: row.try_get("is_compressed")?,
        compression_ratio: row.try_get("compression_ratio")?,
        integrity_hash: row.try_get("integrity_hash")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
        is_revoked: row.try_get("is_revoked")?,
        revoked_at: row.try_get("revoked_at")?,
        revocation_reason: row.try_get("revocation_reason")?,
        access_count: to_u64(row.try_get("access_count")?, "access_count")?,
        last_accessed_at: row.try_get("last_accessed_at")?,
        revision: to_u64(row.try_get("revision")?, "revision")?,
    })
}

// =============================================================================
// Repository
// =============================================================================

/// PostgreSQL-backed [`TokenRepository`].
#[derive(Clone)]
pub struct PostgresTokenRepository {
    pool: Arc<PgPool>,
}

impl PostgresTokenRepository {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` with default pool options.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PoolOptions::<Postgres>::new().connect(database_url).await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the token tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            query(*statement).execute(self.pool.as_ref()).await?;
        }
        tracing::info!("Token storage schema ready");
        Ok(())
    }

    async fn insert_record(&self, record: &EncryptedTokenRecord) -> StorageResult<()> {
        let sql = format!(
            "INSERT INTO encrypted_token ({RECORD_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        );
        query(&sql)
            .bind(&record.storage_id)
            .bind(record.token_type.as_str())
            .bind(&record.client_id)
            .bind(record.user_id.as_deref())
            .bind(&record.encrypted_data)
            .bind(record.encryption_level.as_str())
            .bind(i64::from(record.key_version))
            .bind(record.is_compressed)
            .bind(record.compression_ratio)
            .bind(&record.integrity_hash)
            .bind(record.expires_at)
            .bind(record.created_at)
            .bind(record.is_revoked)
            .bind(record.revoked_at)
            .bind(record.revocation_reason.as_deref())
            .bind(to_i64(record.access_count, "access_count")?)
            .bind(record.last_accessed_at)
            .bind(to_i64(record.revision, "revision")?)
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| StorageError::from_insert(e, "token record"))?;
        Ok(())
    }

    async fn find_record(&self, storage_id: &str) -> StorageResult<Option<EncryptedTokenRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM encrypted_token WHERE storage_id = $1");
        let row = query(&sql)
            .bind(storage_id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Access counters are left as stored; they are not part of the
    /// integrity hash and may have moved since the caller read the record.
    async fn replace_record(
        &self,
        record: &EncryptedTokenRecord,
        expected_revision: u64,
    ) -> StorageResult<bool> {
        let result = query(
            r#"
            UPDATE encrypted_token SET
                token_type = $2,
                client_id = $3,
                user_id = $4,
                encrypted_data = $5,
                encryption_level = $6,
                key_version = $7,
                is_compressed = $8,
                compression_ratio = $9,
                integrity_hash = $10,
                expires_at = $11,
                created_at = $12,
                is_revoked = $13,
                revoked_at = $14,
                revocation_reason = $15,
                revision = $16
            WHERE storage_id = $1 AND revision = $17
            "#,
        )
        .bind(&record.storage_id)
        .bind(record.token_type.as_str())
        .bind(&record.client_id)
        .bind(record.user_id.as_deref())
        .bind(&record.encrypted_data)
        .bind(record.encryption_level.as_str())
        .bind(i64::from(record.key_version))
        .bind(record.is_compressed)
        .bind(record.compression_ratio)
        .bind(&record.integrity_hash)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.is_revoked)
        .bind(record.revoked_at)
        .bind(record.revocation_reason.as_deref())
        .bind(to_i64(record.revision, "revision")?)
        .bind(to_i64(expected_revision, "revision")?)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_stale_records(
        &self,
        target_version: u32,
        after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<EncryptedTokenRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM encrypted_token \
             WHERE key_version <> $1 AND ($2::TEXT IS NULL OR storage_id > $2) \
             ORDER BY storage_id LIMIT $3"
        );
        let rows = query(&sql)
            .bind(i64::from(target_version))
            .bind(after)
            .bind(limit)
            .fetch_all(self.pool.as_ref())
            .await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl TokenRepository for PostgresTokenRepository {
    async fn insert(&self, record: &EncryptedTokenRecord) -> AuthResult<()> {
        Ok(self.insert_record(record).await?)
    }

    async fn find(&self, storage_id: &str) -> AuthResult<Option<EncryptedTokenRecord>> {
        Ok(self.find_record(storage_id).await?)
    }

    async fn replace_if_revision(
        &self,
        record: &EncryptedTokenRecord,
        expected_revision: u64,
    ) -> AuthResult<bool> {
        Ok(self.replace_record(record, expected_revision).await?)
    }

    async fn record_access(&self, storage_id: &str, at: OffsetDateTime) -> AuthResult<()> {
        query(
            r#"
            UPDATE encrypted_token
            SET access_count = access_count + 1, last_accessed_at = $2
            WHERE storage_id = $1
            "#,
        )
        .bind(storage_id)
        .bind(at)
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn delete(&self, storage_id: &str) -> AuthResult<bool> {
        let result = query("DELETE FROM encrypted_token WHERE storage_id = $1")
            .bind(storage_id)
            .execute(self.pool.as_ref())
            .await
            .map_err(StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_stale(
        &self,
        target_version: u32,
        after: Option<&str>,
        limit: usize,
    ) -> AuthResult<Vec<EncryptedTokenRecord>> {
        Ok(self.list_stale_records(target_version, after, limit).await?)
    }

    async fn count_by_key_version(&self, key_version: u32) -> AuthResult<u64> {
        let count: i64 =
            query_scalar("SELECT COUNT(*) FROM encrypted_token WHERE key_version = $1")
                .bind(i64::from(key_version))
                .fetch_one(self.pool.as_ref())
                .await
                .map_err(StorageError::from)?;
        Ok(to_u64(count, "count")?)
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> AuthResult<u64> {
        let result = query("DELETE FROM encrypted_token WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.as_ref())
            .await
            .map_err(StorageError::from)?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::debug!(deleted, "Deleted expired token records");
        }
        Ok(deleted)
    }

    async fn index_token(&self, token_hash: &str, storage_id: &str) -> AuthResult<()> {
        query("INSERT INTO token_index (token_hash, storage_id) VALUES ($1, $2)")
            .bind(token_hash)
            .bind(storage_id)
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| StorageError::from_insert(e, "token hash"))?;
        Ok(())
    }

    async fn find_by_token_hash(&self, token_hash: &str) -> AuthResult<Option<String>> {
        let storage_id: Option<String> =
            query_scalar("SELECT storage_id FROM token_index WHERE token_hash = $1")
                .bind(token_hash)
                .fetch_optional(self.pool.as_ref())
                .await
                .map_err(StorageError::from)?;
        Ok(storage_id)
    }

    async fn associate(&self, from: &str, to: &str) -> AuthResult<()> {
        query(
            r#"
            INSERT INTO token_association (from_storage_id, to_storage_id)
            VALUES ($1, $2)
            ON CONFLICT (from_storage_id) DO UPDATE SET to_storage_id = EXCLUDED.to_storage_id
            "#,
        )
        .bind(from)
        .bind(to)
        .execute(self.pool.as_ref())
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn find_association(&self, from: &str) -> AuthResult<Option<String>> {
        let to: Option<String> = query_scalar(
            "SELECT to_storage_id FROM token_association WHERE from_storage_id = $1",
        )
        .bind(from)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(StorageError::from)?;
        Ok(to)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_counter_conversion_bounds() {
        assert_eq!(to_i64(42, "revision").unwrap(), 42);
        assert!(to_i64(u64::MAX, "revision").is_err());
        assert_eq!(to_u64(7, "access_count").unwrap(), 7);
        assert!(to_u64(-1, "access_count").is_err());
    }

    #[test]
    fn test_schema_covers_every_record_column() {
        let table = SCHEMA[0];
        for column in RECORD_COLUMNS.split(',').map(str::trim) {
            assert!(table.contains(column), "missing column {column}");
        }
    }

    fn record(storage_id: &str) -> EncryptedTokenRecord {
        EncryptedTokenRecord {
            storage_id: storage_id.to_string(),
            token_type: TokenType::Access,
            client_id: "client-1".to_string(),
            user_id: None,
            encrypted_data: "AAAA".to_string(),
            encryption_level: EncryptionLevel::Standard,
            key_version: 1,
            is_compressed: false,
            compression_ratio: 1.0,
            integrity_hash: "00".to_string(),
            expires_at: datetime!(2030-06-01 01:00 UTC),
            created_at: datetime!(2030-06-01 00:00 UTC),
            is_revoked: false,
            revoked_at: None,
            revocation_reason: None,
            access_count: 0,
            last_accessed_at: None,
            revision: 0,
        }
    }

    /// Runs against a live database when `TESSERA_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn test_repository_against_database() {
        let Ok(url) = std::env::var("TESSERA_TEST_DATABASE_URL") else {
            return;
        };
        let repo = PostgresTokenRepository::connect(&url).await.unwrap();
        repo.ensure_schema().await.unwrap();

        let suffix = unique_suffix();
        let a = record(&format!("a-{suffix}"));
        let b = record(&format!("b-{suffix}"));
        repo.insert(&a).await.unwrap();
        repo.insert(&b).await.unwrap();
        assert!(repo.insert(&a).await.is_err());

        let found = repo.find(&a.storage_id).await.unwrap().unwrap();
        assert_eq!(found, a);

        let hash = format!("hash-{suffix}");
        repo.index_token(&hash, &a.storage_id).await.unwrap();
        assert!(repo.index_token(&hash, &b.storage_id).await.is_err());
        assert_eq!(
            repo.find_by_token_hash(&hash).await.unwrap().as_deref(),
            Some(a.storage_id.as_str())
        );

        let mut updated = found.clone();
        updated.key_version = 2;
        updated.revision = 1;
        assert!(repo.replace_if_revision(&updated, 0).await.unwrap());
        assert!(!repo.replace_if_revision(&updated, 0).await.unwrap());

        repo.record_access(&a.storage_id, datetime!(2030-06-01 00:30 UTC))
            .await
            .unwrap();
        let accessed = repo.find(&a.storage_id).await.unwrap().unwrap();
        assert_eq!(accessed.access_count, 1);
        assert_eq!(accessed.key_version, 2);

        repo.associate(&b.storage_id, &a.storage_id).await.unwrap();
        assert_eq!(
            repo.find_association(&b.storage_id).await.unwrap().as_deref(),
            Some(a.storage_id.as_str())
        );

        assert!(repo.delete(&a.storage_id).await.unwrap());
        assert!(repo.find_by_token_hash(&hash).await.unwrap().is_none());
        assert!(repo.find_association(&b.storage_id).await.unwrap().is_none());
        assert!(repo.delete(&b.storage_id).await.unwrap());
    }

    fn unique_suffix() -> String {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        format!("{nanos:x}")
    }
}
