//! Token security error types.
//!
//! This module defines the error taxonomy shared by every component of the
//! token security core. Component-local errors (`JwtError`, `CryptoError`,
//! `CertificateError`, `ConfigError`) convert into [`AuthError`] at the
//! service boundary.
//!
//! Cryptographic and integrity failures are terminal for the request and are
//! never retried. Only [`AuthError::KeyRotationInProgress`] and transient
//! [`AuthError::Storage`] failures are retryable.

use std::fmt;

/// Errors that can occur while issuing, storing, validating or revoking tokens.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The client is unknown, inactive or not allowed to perform the operation.
    #[error("Invalid client: {message}")]
    InvalidClient {
        /// Description of why the client is invalid.
        message: String,
    },

    /// The requested scope is invalid or not allowed for the client.
    #[error("Invalid scope: {message}")]
    InvalidScope {
        /// Description of why the scope is invalid.
        message: String,
    },

    /// The request is malformed (e.g. reserved claim names in custom claims).
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// The token is malformed or failed validation.
    #[error("Invalid token: {message}")]
    InvalidToken {
        /// Description of why the token is invalid.
        message: String,
    },

    /// The caller is authenticated but not allowed to act on this token.
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Description of why access is forbidden.
        message: String,
    },

    /// A signature, MAC or AEAD tag did not verify.
    #[error("Cryptographic failure: {message}")]
    CryptographicFailure {
        /// Failure class (never contains key material or plaintext).
        message: String,
    },

    /// The stored record's integrity hash did not verify.
    #[error("Integrity check failed for record {storage_id}")]
    IntegrityFailure {
        /// Storage handle of the tampered record.
        storage_id: String,
    },

    /// The token or record has expired.
    #[error("Token expired")]
    TokenExpired,

    /// The token or certificate is not yet valid.
    #[error("Token not yet valid")]
    NotYetValid,

    /// The token has been explicitly revoked.
    #[error("Token revoked")]
    TokenRevoked,

    /// The presented certificate does not match the token's confirmation claim.
    #[error("Certificate binding mismatch: {message}")]
    BindingMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// The signing algorithm is not in the configured allow-list.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm {
        /// The rejected algorithm name.
        algorithm: String,
    },

    /// The requested record does not exist.
    #[error("Not found: {resource}")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },

    /// A key rotation is already running.
    #[error("Key rotation in progress")]
    KeyRotationInProgress,

    /// A network-bound step did not complete in time.
    #[error("Timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// An error occurred while storing or retrieving token records.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// The configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `InvalidClient` error.
    #[must_use]
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::InvalidClient {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidScope` error.
    #[must_use]
    pub fn invalid_scope(message: impl Into<String>) -> Self {
        Self::InvalidScope {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidToken` error.
    #[must_use]
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken {
            message: message.into(),
        }
    }

    /// Creates a new `Forbidden` error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Creates a new `CryptographicFailure` error.
    #[must_use]
    pub fn cryptographic(message: impl Into<String>) -> Self {
        Self::CryptographicFailure {
            message: message.into(),
        }
    }

    /// Creates a new `IntegrityFailure` error.
    #[must_use]
    pub fn integrity(storage_id: impl Into<String>) -> Self {
        Self::IntegrityFailure {
            storage_id: storage_id.into(),
        }
    }

    /// Creates a new `BindingMismatch` error.
    #[must_use]
    pub fn binding_mismatch(message: impl Into<String>) -> Self {
        Self::BindingMismatch {
            message: message.into(),
        }
    }

    /// Creates a new `UnsupportedAlgorithm` error.
    #[must_use]
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a client error (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidClient { .. }
                | Self::InvalidScope { .. }
                | Self::InvalidRequest { .. }
                | Self::InvalidToken { .. }
                | Self::Forbidden { .. }
                | Self::TokenExpired
                | Self::NotYetValid
                | Self::TokenRevoked
                | Self::BindingMismatch { .. }
                | Self::UnsupportedAlgorithm { .. }
                | Self::NotFound { .. }
        )
    }

    /// Returns `true` if this is a server error (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. }
                | Self::Configuration { .. }
                | Self::Internal { .. }
                | Self::KeyRotationInProgress
                | Self::Timeout { .. }
                | Self::CryptographicFailure { .. }
                | Self::IntegrityFailure { .. }
        )
    }

    /// Returns `true` if the caller may retry the operation with backoff.
    ///
    /// Cryptographic and integrity failures are never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::KeyRotationInProgress | Self::Storage { .. } | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this error came from a failed cryptographic check.
    #[must_use]
    pub fn is_cryptographic(&self) -> bool {
        matches!(
            self,
            Self::CryptographicFailure { .. } | Self::IntegrityFailure { .. }
        )
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidClient { .. } | Self::Forbidden { .. } => ErrorCategory::Authorization,
            Self::InvalidScope { .. } => ErrorCategory::Authorization,
            Self::InvalidRequest { .. } => ErrorCategory::Validation,
            Self::InvalidToken { .. }
            | Self::TokenExpired
            | Self::NotYetValid
            | Self::TokenRevoked
            | Self::UnsupportedAlgorithm { .. } => ErrorCategory::Token,
            Self::BindingMismatch { .. } => ErrorCategory::Binding,
            Self::CryptographicFailure { .. } | Self::IntegrityFailure { .. } => {
                ErrorCategory::Cryptographic
            }
            Self::NotFound { .. } | Self::Storage { .. } | Self::KeyRotationInProgress => {
                ErrorCategory::Infrastructure
            }
            Self::Timeout { .. } => ErrorCategory::Infrastructure,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the stable reason code surfaced by issuance and revocation.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidClient { .. } => "invalid_client",
            Self::InvalidScope { .. } => "invalid_scope",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::InvalidToken { .. } => "invalid_token",
            Self::Forbidden { .. } => "unauthorized_client",
            Self::CryptographicFailure { .. } => "cryptographic_failure",
            Self::IntegrityFailure { .. } => "integrity_failure",
            Self::TokenExpired | Self::NotYetValid => "expired_or_not_yet_valid",
            Self::TokenRevoked => "revoked_token",
            Self::BindingMismatch { .. } => "binding_mismatch",
            Self::UnsupportedAlgorithm { .. } => "unsupported_algorithm",
            Self::NotFound { .. } => "not_found",
            Self::KeyRotationInProgress => "key_rotation_in_progress",
            Self::Timeout { .. } => "timeout",
            Self::Storage { .. } => "server_error",
            Self::Configuration { .. } => "server_error",
            Self::Internal { .. } => "server_error",
        }
    }
}

/// Categories of token security errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Client or scope permission errors.
    Authorization,
    /// Token validation errors (expiry, revocation, algorithm).
    Token,
    /// Certificate binding errors.
    Binding,
    /// Signature, MAC or AEAD failures.
    Cryptographic,
    /// Request validation errors.
    Validation,
    /// Infrastructure/storage errors.
    Infrastructure,
    /// Configuration errors.
    Configuration,
    /// Internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authorization => write!(f, "authorization"),
            Self::Token => write!(f, "token"),
            Self::Binding => write!(f, "binding"),
            Self::Cryptographic => write!(f, "cryptographic"),
            Self::Validation => write!(f, "validation"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AuthError::invalid_client("client not found");
        assert_eq!(err.to_string(), "Invalid client: client not found");

        let err = AuthError::integrity("st-1");
        assert_eq!(err.to_string(), "Integrity check failed for record st-1");

        let err = AuthError::TokenExpired;
        assert_eq!(err.to_string(), "Token expired");
    }

    #[test]
    fn test_error_predicates() {
        let err = AuthError::binding_mismatch("thumbprint differs");
        assert!(err.is_client_error());
        assert!(!err.is_server_error());
        assert!(!err.is_retryable());

        let err = AuthError::integrity("st-1");
        assert!(err.is_cryptographic());
        assert!(!err.is_retryable());

        let err = AuthError::KeyRotationInProgress;
        assert!(err.is_retryable());
        assert!(err.is_server_error());

        let err = AuthError::storage("database down");
        assert!(err.is_retryable());
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            AuthError::invalid_client("test").category(),
            ErrorCategory::Authorization
        );
        assert_eq!(AuthError::TokenRevoked.category(), ErrorCategory::Token);
        assert_eq!(
            AuthError::cryptographic("bad tag").category(),
            ErrorCategory::Cryptographic
        );
        assert_eq!(
            AuthError::binding_mismatch("x").category(),
            ErrorCategory::Binding
        );
        assert_eq!(
            AuthError::timeout("fetch").category(),
            ErrorCategory::Infrastructure
        );
    }

    #[test]
    fn test_reason_code() {
        assert_eq!(AuthError::TokenRevoked.reason_code(), "revoked_token");
        assert_eq!(
            AuthError::binding_mismatch("x").reason_code(),
            "binding_mismatch"
        );
        assert_eq!(
            AuthError::unsupported_algorithm("none").reason_code(),
            "unsupported_algorithm"
        );
        assert_eq!(AuthError::storage("x").reason_code(), "server_error");
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Cryptographic.to_string(), "cryptographic");
        assert_eq!(ErrorCategory::Binding.to_string(), "binding");
    }
}
