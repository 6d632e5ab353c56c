//! PostgreSQL storage backend for tessera-auth
//!
//! Provides durable storage for encrypted token records:
//!
//! - `encrypted_token` - One row per record, ciphertext plus indexable metadata
//! - `token_index` - Token hash to storage id
//! - `token_association` - Refresh token record to its access token record
//!
//! Tables are created by [`PostgresTokenRepository::ensure_schema`].
//!
//! # Example
//!
//! ```ignore
//! use tessera_auth_postgres::PostgresTokenRepository;
//!
//! let repository = PostgresTokenRepository::connect("postgres://localhost/tessera").await?;
//! repository.ensure_schema().await?;
//! let store = EncryptedTokenStore::new(Arc::new(repository), keys, config.storage);
//! ```

pub mod token_record;

use sqlx_core::pool::Pool;
use sqlx_postgres::Postgres;
use tessera_auth::AuthError;

/// PostgreSQL connection pool type alias.
pub type PgPool = Pool<Postgres>;

pub use token_record::PostgresTokenRepository;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during token storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx_core::Error),

    /// Requested row was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Row already exists (conflict).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored value could not be converted.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl StorageError {
    // -------------------------------------------------------------------------
    // Constructor Methods
    // -------------------------------------------------------------------------

    /// Create a `NotFound` error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Create a `Conflict` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create an `InvalidData` error.
    #[must_use]
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    // -------------------------------------------------------------------------
    // Predicate Methods
    // -------------------------------------------------------------------------

    /// Returns `true` if this is a `NotFound` error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` if this is a `Conflict` error.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns `true` if this is a database error.
    #[must_use]
    pub fn is_database_error(&self) -> bool {
        matches!(self, Self::Database(_))
    }

    /// Maps a unique-constraint violation to `Conflict`.
    pub(crate) fn from_insert(err: sqlx_core::Error, what: &str) -> Self {
        match &err {
            sqlx_core::Error::Database(db) if db.is_unique_violation() => {
                Self::conflict(format!("{what} already exists"))
            }
            _ => Self::Database(err),
        }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(resource) => AuthError::not_found(resource),
            other => AuthError::storage(other.to_string()),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_not_found() {
        let err = StorageError::not_found("record abc123");
        assert!(err.is_not_found());
        assert!(!err.is_database_error());
        assert_eq!(err.to_string(), "Not found: record abc123");

        let auth: AuthError = err.into();
        assert!(matches!(auth, AuthError::NotFound { .. }));
    }

    #[test]
    fn test_storage_error_conflict() {
        let err = StorageError::conflict("record already exists");
        assert!(err.is_conflict());

        let auth: AuthError = err.into();
        assert!(matches!(auth, AuthError::Storage { .. }));
        assert!(auth.is_server_error());
    }

    #[test]
    fn test_storage_error_invalid_data() {
        let err = StorageError::invalid_data("unknown token type 'x'");
        assert_eq!(err.to_string(), "Invalid data: unknown token type 'x'");
    }
}
