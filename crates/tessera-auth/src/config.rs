//! Token security configuration.
//!
//! This module provides the typed configuration for the token security core:
//! token issuance, encrypted storage, mTLS binding and master key sourcing.
//! Configuration is constructed through [`TokenSecurityConfig::from_toml_str`]
//! or [`TokenSecurityConfig::load`], both of which validate before returning.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionLevel;
use crate::crypto::cipher::{MAX_CONFIGURED_ITERATIONS, MAX_MEMORY_KIB};
use crate::token::SigningAlgorithm;

/// Default environment variable holding the master key.
pub const DEFAULT_MASTER_KEY_ENV: &str = "TESSERA_MASTER_KEY";

/// Root token security configuration.
///
/// # Example (TOML)
///
/// ```toml
/// [token]
/// issuer = "https://auth.example.com"
/// access_token_lifetime = "1h"
/// signing_algorithm = "ES384"
/// allowed_algorithms = ["ES384", "RS256"]
///
/// [storage]
/// encryption_level = "high"
/// key_derivation_iterations = 3
///
/// [mtls]
/// certificate_fetch_timeout = "5s"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenSecurityConfig {
    /// Token issuance settings.
    pub token: TokenConfig,

    /// Encrypted token store settings.
    pub storage: StorageConfig,

    /// Mutual-TLS binding settings.
    pub mtls: MtlsConfig,

    /// Master key sourcing.
    pub keys: KeysConfig,
}

/// Token issuance configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Issuer URL placed in the `iss` claim.
    pub issuer: String,

    /// Audience used when the caller supplies none.
    pub default_audience: Option<String>,

    /// Access token lifetime (`ttl` default).
    #[serde(with = "humantime_serde")]
    pub access_token_lifetime: Duration,

    /// Refresh token lifetime.
    #[serde(with = "humantime_serde")]
    pub refresh_token_lifetime: Duration,

    /// Issue an opaque refresh token alongside each access token.
    pub issue_refresh_tokens: bool,

    /// Algorithm used to sign new tokens.
    pub signing_algorithm: String,

    /// Algorithms accepted on validation.
    pub allowed_algorithms: Vec<String>,

    /// Clock skew tolerance for `exp` and `nbf`.
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080".to_string(),
            default_audience: None,
            access_token_lifetime: Duration::from_secs(3600), // 1 hour
            refresh_token_lifetime: Duration::from_secs(90 * 24 * 3600), // 90 days
            issue_refresh_tokens: false,
            signing_algorithm: "ES384".to_string(),
            allowed_algorithms: vec![
                "ES384".to_string(),
                "RS256".to_string(),
                "RS384".to_string(),
            ],
            leeway: Duration::ZERO,
        }
    }
}

/// Encrypted token store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Encryption level applied to new records.
    pub encryption_level: EncryptionLevel,

    /// Argon2 time cost for the `high` and `extreme` levels.
    pub key_derivation_iterations: u32,

    /// Argon2 memory cost in KiB.
    pub key_derivation_memory_kib: u32,

    /// Deflate ciphertext when that makes it smaller.
    pub compress_payloads: bool,

    /// Delete expired records when a read finds them.
    pub evict_expired_on_read: bool,

    /// Records migrated per page during key rotation.
    pub rotation_batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            encryption_level: EncryptionLevel::Standard,
            key_derivation_iterations: 3,
            key_derivation_memory_kib: 19 * 1024,
            compress_payloads: true,
            evict_expired_on_read: true,
            rotation_batch_size: 100,
        }
    }
}

/// Mutual-TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MtlsConfig {
    /// Also embed the SHA-1 `x5t` thumbprint in `cnf`.
    pub include_legacy_thumbprint: bool,

    /// Upper bound for remote certificate retrieval.
    #[serde(with = "humantime_serde")]
    pub certificate_fetch_timeout: Duration,

    /// Base URL of the mTLS endpoint aliases advertised in discovery.
    pub endpoint_base_url: Option<String>,
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            include_legacy_thumbprint: false,
            certificate_fetch_timeout: Duration::from_secs(10),
            endpoint_base_url: None,
        }
    }
}

/// Master key sourcing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Environment variable holding the hex or base64 master key.
    pub master_key_env: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            master_key_env: DEFAULT_MASTER_KEY_ENV.to_string(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// The configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(String),
}

impl From<ConfigError> for crate::AuthError {
    fn from(err: ConfigError) -> Self {
        crate::AuthError::configuration(err.to_string())
    }
}

impl TokenSecurityConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML, otherwise any error
    /// from [`validate`](Self::validate).
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if:
    /// - The issuer is empty
    /// - The allow-list is empty or names an unknown algorithm
    /// - The signing algorithm is unknown or not in the allow-list
    /// - A token lifetime is zero
    /// - The KDF parameters are below the Argon2 minimum or above what stored
    ///   records may carry
    /// - The rotation batch size is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.issuer.is_empty() {
            return Err(ConfigError::InvalidValue(
                "issuer cannot be empty".to_string(),
            ));
        }

        let allowed = self.allowed_algorithms()?;
        let signing = self.signing_algorithm()?;
        if !allowed.contains(&signing) {
            return Err(ConfigError::InvalidValue(format!(
                "signing algorithm '{signing}' is not in allowed_algorithms"
            )));
        }

        if self.token.access_token_lifetime.is_zero() {
            return Err(ConfigError::InvalidValue(
                "access_token_lifetime must be > 0".to_string(),
            ));
        }

        if self.token.refresh_token_lifetime.is_zero() {
            return Err(ConfigError::InvalidValue(
                "refresh_token_lifetime must be > 0".to_string(),
            ));
        }

        if self.storage.key_derivation_iterations < argon2::Params::MIN_T_COST {
            return Err(ConfigError::InvalidValue(format!(
                "key_derivation_iterations must be >= {}",
                argon2::Params::MIN_T_COST
            )));
        }

        if self.storage.key_derivation_memory_kib < argon2::Params::MIN_M_COST {
            return Err(ConfigError::InvalidValue(format!(
                "key_derivation_memory_kib must be >= {}",
                argon2::Params::MIN_M_COST
            )));
        }

        if self.storage.key_derivation_iterations > MAX_CONFIGURED_ITERATIONS {
            return Err(ConfigError::InvalidValue(format!(
                "key_derivation_iterations must be <= {MAX_CONFIGURED_ITERATIONS}"
            )));
        }

        if self.storage.key_derivation_memory_kib > MAX_MEMORY_KIB {
            return Err(ConfigError::InvalidValue(format!(
                "key_derivation_memory_kib must be <= {MAX_MEMORY_KIB}"
            )));
        }

        if self.storage.rotation_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "rotation_batch_size must be > 0".to_string(),
            ));
        }

        if self.keys.master_key_env.is_empty() {
            return Err(ConfigError::Missing("keys.master_key_env".to_string()));
        }

        Ok(())
    }

    /// Returns the parsed signing algorithm.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an unknown algorithm name.
    pub fn signing_algorithm(&self) -> Result<SigningAlgorithm, ConfigError> {
        SigningAlgorithm::from_str(&self.token.signing_algorithm).map_err(|_| {
            ConfigError::InvalidValue(format!(
                "Invalid signing algorithm: '{}'",
                self.token.signing_algorithm
            ))
        })
    }

    /// Returns the parsed validation allow-list.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the list is empty or contains an
    /// unknown algorithm name.
    pub fn allowed_algorithms(&self) -> Result<Vec<SigningAlgorithm>, ConfigError> {
        if self.token.allowed_algorithms.is_empty() {
            return Err(ConfigError::InvalidValue(
                "allowed_algorithms cannot be empty".to_string(),
            ));
        }

        self.token
            .allowed_algorithms
            .iter()
            .map(|name| {
                SigningAlgorithm::from_str(name).map_err(|_| {
                    ConfigError::InvalidValue(format!("Invalid allowed algorithm: '{name}'"))
                })
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> TokenSecurityConfig {
    let mut config = TokenSecurityConfig::default();
    config.token.issuer = "https://auth.example.com".to_string();
    config.storage.key_derivation_iterations = 1;
    config.storage.key_derivation_memory_kib = 1024;
    config.storage.rotation_batch_size = 2;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = TokenSecurityConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.token.signing_algorithm, "ES384");
        assert_eq!(config.storage.encryption_level, EncryptionLevel::Standard);
        assert!(config.storage.evict_expired_on_read);
        assert_eq!(config.keys.master_key_env, "TESSERA_MASTER_KEY");
    }

    #[test]
    fn test_empty_issuer_fails_validation() {
        let mut config = TokenSecurityConfig::default();
        config.token.issuer = String::new();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
        assert!(err.to_string().contains("issuer"));
    }

    #[test]
    fn test_signing_algorithm_must_be_allowed() {
        let mut config = TokenSecurityConfig::default();
        config.token.signing_algorithm = "HS256".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("allowed_algorithms"));
    }

    #[test]
    fn test_unknown_algorithm_fails_validation() {
        let mut config = TokenSecurityConfig::default();
        config.token.allowed_algorithms = vec!["none".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("none"));
    }

    #[test]
    fn test_empty_allow_list_fails_validation() {
        let mut config = TokenSecurityConfig::default();
        config.token.allowed_algorithms.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_zero_lifetime_fails_validation() {
        let mut config = TokenSecurityConfig::default();
        config.token.access_token_lifetime = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("access_token_lifetime"));
    }

    #[test]
    fn test_kdf_minimums() {
        let mut config = TokenSecurityConfig::default();
        config.storage.key_derivation_iterations = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_derivation_iterations"));

        let mut config = TokenSecurityConfig::default();
        config.storage.key_derivation_memory_kib = 4;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_derivation_memory_kib"));
    }

    #[test]
    fn test_kdf_maximums() {
        let mut config = TokenSecurityConfig::default();
        config.storage.key_derivation_iterations = MAX_CONFIGURED_ITERATIONS;
        assert!(config.validate().is_ok());

        config.storage.key_derivation_iterations = MAX_CONFIGURED_ITERATIONS + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_derivation_iterations must be <="));

        let mut config = TokenSecurityConfig::default();
        config.storage.key_derivation_memory_kib = MAX_MEMORY_KIB + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_derivation_memory_kib must be <="));
    }

    #[test]
    fn test_zero_batch_size_fails_validation() {
        let mut config = TokenSecurityConfig::default();
        config.storage.rotation_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let config = TokenSecurityConfig::from_toml_str(
            r#"
            [token]
            issuer = "https://auth.example.com"
            access_token_lifetime = "15m"
            signing_algorithm = "HS256"
            allowed_algorithms = ["HS256"]

            [storage]
            encryption_level = "extreme"
            key_derivation_iterations = 2

            [mtls]
            include_legacy_thumbprint = true
            certificate_fetch_timeout = "3s"
            "#,
        )
        .unwrap();

        assert_eq!(config.token.access_token_lifetime, Duration::from_secs(900));
        assert_eq!(config.signing_algorithm().unwrap(), SigningAlgorithm::HS256);
        assert_eq!(config.storage.encryption_level, EncryptionLevel::Extreme);
        assert_eq!(config.storage.key_derivation_iterations, 2);
        assert!(config.mtls.include_legacy_thumbprint);
        assert_eq!(config.mtls.certificate_fetch_timeout, Duration::from_secs(3));
        assert_eq!(config.storage.rotation_batch_size, 100);
    }

    #[test]
    fn test_from_toml_str_rejects_invalid() {
        let err = TokenSecurityConfig::from_toml_str("[token]\nissuer = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));

        let err = TokenSecurityConfig::from_toml_str("[token\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");
        std::fs::write(&path, "[storage]\nencryption_level = \"high\"\n").unwrap();

        let config = TokenSecurityConfig::load(&path).unwrap();
        assert_eq!(config.storage.encryption_level, EncryptionLevel::High);

        let err = TokenSecurityConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue("test error".to_string());
        assert_eq!(err.to_string(), "Invalid configuration value: test error");

        let err = ConfigError::Missing("required_field".to_string());
        assert_eq!(
            err.to_string(),
            "Missing required configuration: required_field"
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = TokenSecurityConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: TokenSecurityConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.token.issuer, parsed.token.issuer);
        assert_eq!(
            config.storage.key_derivation_iterations,
            parsed.storage.key_derivation_iterations
        );
    }
}
