//! JWT access token encoding.
//!
//! Tokens follow RFC 9068: header `typ` is `at+jwt` and the `kid` names the
//! signing key. The service signs with one key and verifies with any key in
//! its set whose algorithm exactly matches the token header.
//!
//! ## Supported Algorithms
//!
//! - **HS256 / HS384 / HS512**: HMAC with a shared secret (never exported)
//! - **RS256 / RS384**: RSA PKCS#1 v1.5
//! - **ES384**: ECDSA with P-384 curve
//!
//! ## Example
//!
//! ```ignore
//! use tessera_auth::token::{JwtService, SigningKeyPair, TokenRequest};
//!
//! let key_pair = SigningKeyPair::generate_ec()?;
//! let jwt = JwtService::new(key_pair, "https://auth.example.com");
//!
//! let request = TokenRequest::new("user-1", "c1")
//!     .with_scopes(["read", "write"])
//!     .with_audience("https://api.example.com".into());
//! let (token, claims) = jwt.issue(request)?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, encode};
use p384::SecretKey as EcSecretKey;
use p384::ecdsa::SigningKey as EcSigningKey;
use p384::pkcs8::{DecodePrivateKey as EcDecodePrivateKey, EncodePrivateKey as EcEncodePrivateKey};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::claims::{AccessTokenClaims, Audience, Confirmation};
use crate::clock::{Clock, SystemClock};
use crate::config::TokenSecurityConfig;
use crate::error::AuthError;

/// Media type placed in the JOSE header `typ`.
pub const ACCESS_TOKEN_TYP: &str = "at+jwt";

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during JWT operations.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    /// Failed to encode a token.
    #[error("Failed to encode token: {message}")]
    EncodingError {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a token.
    #[error("Failed to decode token: {message}")]
    DecodingError {
        /// Description of the decoding error.
        message: String,
    },

    /// The token signature is invalid.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The token claims are invalid.
    #[error("Invalid claims: {message}")]
    InvalidClaims {
        /// Description of why claims are invalid.
        message: String,
    },

    /// A required claim is missing.
    #[error("Missing required claim: {claim}")]
    MissingClaim {
        /// Name of the missing claim.
        claim: String,
    },

    /// The algorithm is unknown or not allowed.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm {
        /// The rejected algorithm name.
        algorithm: String,
    },

    /// The specified key was not found.
    #[error("Key not found: {kid}")]
    KeyNotFound {
        /// The key ID that was not found.
        kid: String,
    },

    /// Failed to generate a cryptographic key.
    #[error("Key generation error: {message}")]
    KeyGenerationError {
        /// Description of the key generation error.
        message: String,
    },

    /// Invalid key format or data.
    #[error("Invalid key: {message}")]
    InvalidKey {
        /// Description of why the key is invalid.
        message: String,
    },
}

impl JwtError {
    /// Creates a new `EncodingError`.
    #[must_use]
    pub fn encoding_error(message: impl Into<String>) -> Self {
        Self::EncodingError {
            message: message.into(),
        }
    }

    /// Creates a new `DecodingError`.
    #[must_use]
    pub fn decoding_error(message: impl Into<String>) -> Self {
        Self::DecodingError {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidClaims` error.
    #[must_use]
    pub fn invalid_claims(message: impl Into<String>) -> Self {
        Self::InvalidClaims {
            message: message.into(),
        }
    }

    /// Creates a new `MissingClaim` error.
    #[must_use]
    pub fn missing_claim(claim: impl Into<String>) -> Self {
        Self::MissingClaim {
            claim: claim.into(),
        }
    }

    /// Creates a new `UnsupportedAlgorithm` error.
    #[must_use]
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Creates a new `KeyNotFound` error.
    #[must_use]
    pub fn key_not_found(kid: impl Into<String>) -> Self {
        Self::KeyNotFound { kid: kid.into() }
    }

    /// Creates a new `KeyGenerationError`.
    #[must_use]
    pub fn key_generation_error(message: impl Into<String>) -> Self {
        Self::KeyGenerationError {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidKey` error.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a key-related error.
    #[must_use]
    pub fn is_key_error(&self) -> bool {
        matches!(
            self,
            Self::KeyNotFound { .. } | Self::KeyGenerationError { .. } | Self::InvalidKey { .. }
        )
    }
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::MissingAlgorithm => Self::unsupported_algorithm(err.to_string()),
            ErrorKind::InvalidAudience
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidSubject
            | ErrorKind::MissingRequiredClaim(_) => Self::invalid_claims(err.to_string()),
            ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidKeyFormat => Self::invalid_key(err.to_string()),
            _ => Self::decoding_error(err.to_string()),
        }
    }
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::InvalidSignature => AuthError::cryptographic("invalid token signature"),
            JwtError::UnsupportedAlgorithm { algorithm } => {
                AuthError::unsupported_algorithm(algorithm)
            }
            JwtError::InvalidClaims { .. } | JwtError::MissingClaim { .. } => {
                AuthError::invalid_request(err.to_string())
            }
            JwtError::DecodingError { .. } => AuthError::invalid_token(err.to_string()),
            JwtError::EncodingError { .. }
            | JwtError::KeyNotFound { .. }
            | JwtError::KeyGenerationError { .. }
            | JwtError::InvalidKey { .. } => AuthError::internal(err.to_string()),
        }
    }
}

// ============================================================================
// Signing Algorithm
// ============================================================================

/// Supported signing algorithms for JWT tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// HMAC with SHA-256.
    HS256,
    /// HMAC with SHA-384.
    HS384,
    /// HMAC with SHA-512.
    HS512,
    /// RSA with SHA-256 (widely compatible).
    RS256,
    /// RSA with SHA-384.
    RS384,
    /// ECDSA with P-384 curve.
    ES384,
}

impl SigningAlgorithm {
    /// All supported algorithms.
    pub const ALL: [SigningAlgorithm; 6] = [
        Self::HS256,
        Self::HS384,
        Self::HS512,
        Self::RS256,
        Self::RS384,
        Self::ES384,
    ];

    /// Converts to the `jsonwebtoken` Algorithm type.
    #[must_use]
    pub fn to_jwt_algorithm(self) -> Algorithm {
        match self {
            Self::HS256 => Algorithm::HS256,
            Self::HS384 => Algorithm::HS384,
            Self::HS512 => Algorithm::HS512,
            Self::RS256 => Algorithm::RS256,
            Self::RS384 => Algorithm::RS384,
            Self::ES384 => Algorithm::ES384,
        }
    }

    /// Converts from a `jsonwebtoken` Algorithm, if supported.
    #[must_use]
    pub fn from_jwt_algorithm(alg: Algorithm) -> Option<Self> {
        match alg {
            Algorithm::HS256 => Some(Self::HS256),
            Algorithm::HS384 => Some(Self::HS384),
            Algorithm::HS512 => Some(Self::HS512),
            Algorithm::RS256 => Some(Self::RS256),
            Algorithm::RS384 => Some(Self::RS384),
            Algorithm::ES384 => Some(Self::ES384),
            _ => None,
        }
    }

    /// Returns the algorithm name as used in JWK/JWT headers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HS256 => "HS256",
            Self::HS384 => "HS384",
            Self::HS512 => "HS512",
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::ES384 => "ES384",
        }
    }

    /// Returns `true` if this is an HMAC-based algorithm.
    #[must_use]
    pub fn is_hmac(&self) -> bool {
        matches!(self, Self::HS256 | Self::HS384 | Self::HS512)
    }

    /// Returns `true` if this is an RSA-based algorithm.
    #[must_use]
    pub fn is_rsa(&self) -> bool {
        matches!(self, Self::RS256 | Self::RS384)
    }

    /// Returns `true` if this is an EC-based algorithm.
    #[must_use]
    pub fn is_ec(&self) -> bool {
        matches!(self, Self::ES384)
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = JwtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.as_str() == s)
            .ok_or_else(|| JwtError::unsupported_algorithm(s))
    }
}

// ============================================================================
// JWKS Types
// ============================================================================

/// JSON Web Key Set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    /// The keys in this set.
    pub keys: Vec<Jwk>,
}

/// JSON Web Key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA" or "EC").
    pub kty: String,

    /// Key ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Key use ("sig" for signing).
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,

    /// Algorithm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    // RSA-specific fields
    /// RSA modulus (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    // EC-specific fields
    /// EC curve name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC x coordinate (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

// ============================================================================
// Signing Key Pair
// ============================================================================

/// A signing key for JWT operations.
pub struct SigningKeyPair {
    /// Key ID.
    pub kid: String,

    /// Signing algorithm.
    pub algorithm: SigningAlgorithm,

    /// Encoding key (private key or secret) for signing.
    encoding_key: EncodingKey,

    /// Decoding key (public key or secret) for verification.
    decoding_key: DecodingKey,

    /// Public key data for JWKS export.
    public_key_data: PublicKeyData,

    /// When the key was created.
    pub created_at: OffsetDateTime,
}

/// Internal representation of public key data for JWKS export.
enum PublicKeyData {
    Rsa { n: Vec<u8>, e: Vec<u8> },
    Ec { x: Vec<u8>, y: Vec<u8> },
    Symmetric,
}

impl SigningKeyPair {
    /// Generates a new RSA key pair.
    ///
    /// # Errors
    /// Returns an error if key generation fails or algorithm is not RSA-based.
    pub fn generate_rsa(algorithm: SigningAlgorithm) -> Result<Self, JwtError> {
        if !algorithm.is_rsa() {
            return Err(JwtError::invalid_key(format!(
                "Algorithm {algorithm} is not RSA-based"
            )));
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
            .map_err(|e| JwtError::key_generation_error(e.to_string()))?;

        let private_pem = rsa::pkcs8::EncodePrivateKey::to_pkcs8_pem(&private_key, LineEnding::LF)
            .map_err(|e| JwtError::key_generation_error(e.to_string()))?;
        let public_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| JwtError::key_generation_error(e.to_string()))?;

        Self::from_pem(
            uuid::Uuid::new_v4().to_string(),
            algorithm,
            &private_pem,
            &public_pem,
        )
    }

    /// Generates a new EC key pair using P-384 curve.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate_ec() -> Result<Self, JwtError> {
        let secret_key = EcSecretKey::random(&mut OsRng);
        Self::from_ec_secret(uuid::Uuid::new_v4().to_string(), &secret_key)
    }

    /// Generates a random 512-bit HMAC secret.
    ///
    /// # Errors
    /// Returns an error if the algorithm is not HMAC-based.
    pub fn generate_hmac(algorithm: SigningAlgorithm) -> Result<Self, JwtError> {
        let mut secret = [0u8; 64];
        OsRng.fill_bytes(&mut secret);
        Self::from_secret(uuid::Uuid::new_v4().to_string(), algorithm, &secret)
    }

    /// Creates an HMAC key from a shared secret.
    ///
    /// # Errors
    /// Returns an error if the algorithm is not HMAC-based or the secret is
    /// shorter than 32 bytes.
    pub fn from_secret(
        kid: impl Into<String>,
        algorithm: SigningAlgorithm,
        secret: &[u8],
    ) -> Result<Self, JwtError> {
        if !algorithm.is_hmac() {
            return Err(JwtError::invalid_key(format!(
                "Algorithm {algorithm} is not HMAC-based"
            )));
        }
        if secret.len() < 32 {
            return Err(JwtError::invalid_key("HMAC secret must be at least 32 bytes"));
        }

        Ok(Self {
            kid: kid.into(),
            algorithm,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            public_key_data: PublicKeyData::Symmetric,
            created_at: OffsetDateTime::now_utc(),
        })
    }

    /// Loads an asymmetric key pair from PEM strings.
    ///
    /// EC private keys may be PKCS#8 or SEC1; the public PEM is only read
    /// for RSA.
    ///
    /// # Errors
    /// Returns an error if the PEM data is invalid.
    pub fn from_pem(
        kid: impl Into<String>,
        algorithm: SigningAlgorithm,
        private_pem: &str,
        public_pem: &str,
    ) -> Result<Self, JwtError> {
        if algorithm.is_hmac() {
            return Err(JwtError::invalid_key(format!(
                "Algorithm {algorithm} uses a shared secret, not PEM keys"
            )));
        }

        if algorithm.is_ec() {
            let secret_key = EcSecretKey::from_pkcs8_pem(private_pem)
                .or_else(|_| EcSecretKey::from_sec1_pem(private_pem))
                .map_err(|e| JwtError::invalid_key(e.to_string()))?;
            return Self::from_ec_secret(kid, &secret_key);
        }

        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| JwtError::invalid_key(e.to_string()))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| JwtError::invalid_key(e.to_string()))?;

        let public_key = RsaPublicKey::from_public_key_pem(public_pem)
            .map_err(|e| JwtError::invalid_key(e.to_string()))?;
        let n = public_key.n().to_bytes_be();
        let e = public_key.e().to_bytes_be();

        Ok(Self {
            kid: kid.into(),
            algorithm,
            encoding_key,
            decoding_key,
            public_key_data: PublicKeyData::Rsa { n, e },
            created_at: OffsetDateTime::now_utc(),
        })
    }

    fn from_ec_secret(kid: impl Into<String>, secret_key: &EcSecretKey) -> Result<Self, JwtError> {
        let signing_key = EcSigningKey::from(secret_key);
        let point = signing_key.verifying_key().to_encoded_point(false);
        let x = point
            .x()
            .ok_or_else(|| JwtError::invalid_key("Missing x coordinate"))?;
        let y = point
            .y()
            .ok_or_else(|| JwtError::invalid_key("Missing y coordinate"))?;

        // jsonwebtoken reads EC private keys from PKCS#8 PEM only.
        let private_pem = secret_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| JwtError::invalid_key(e.to_string()))?;
        let encoding_key = EncodingKey::from_ec_pem(private_pem.as_bytes())
            .map_err(|e| JwtError::invalid_key(e.to_string()))?;

        let x_b64 = URL_SAFE_NO_PAD.encode(x.as_slice());
        let y_b64 = URL_SAFE_NO_PAD.encode(y.as_slice());
        let decoding_key = DecodingKey::from_ec_components(&x_b64, &y_b64)
            .map_err(|e| JwtError::invalid_key(e.to_string()))?;

        Ok(Self {
            kid: kid.into(),
            algorithm: SigningAlgorithm::ES384,
            encoding_key,
            decoding_key,
            public_key_data: PublicKeyData::Ec {
                x: x.to_vec(),
                y: y.to_vec(),
            },
            created_at: OffsetDateTime::now_utc(),
        })
    }

    /// Exports the public key as a JWK.
    ///
    /// Returns `None` for HMAC keys.
    #[must_use]
    pub fn to_jwk(&self) -> Option<Jwk> {
        let base = Jwk {
            kty: String::new(),
            kid: Some(self.kid.clone()),
            use_: Some("sig".to_string()),
            alg: Some(self.algorithm.as_str().to_string()),
            n: None,
            e: None,
            crv: None,
            x: None,
            y: None,
        };

        match &self.public_key_data {
            PublicKeyData::Rsa { n, e } => Some(Jwk {
                kty: "RSA".to_string(),
                n: Some(URL_SAFE_NO_PAD.encode(n)),
                e: Some(URL_SAFE_NO_PAD.encode(e)),
                ..base
            }),
            PublicKeyData::Ec { x, y } => Some(Jwk {
                kty: "EC".to_string(),
                crv: Some("P-384".to_string()),
                x: Some(URL_SAFE_NO_PAD.encode(x)),
                y: Some(URL_SAFE_NO_PAD.encode(y)),
                ..base
            }),
            PublicKeyData::Symmetric => None,
        }
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Token Request
// ============================================================================

/// Inputs for minting an access token.
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    /// Subject (user or client ID).
    pub subject: String,
    /// OAuth client ID.
    pub client_id: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Audience; falls back to the configured default, then the resources.
    pub audience: Option<Audience>,
    /// Resource indicators.
    pub resource: Option<Vec<String>>,
    /// Confirmation claim for sender-constrained tokens.
    pub confirmation: Option<Confirmation>,
    /// Lifetime; falls back to the configured default.
    pub ttl: Option<Duration>,
    /// Caller-supplied claims.
    pub extra_claims: BTreeMap<String, Value>,
}

impl TokenRequest {
    /// Creates a request for `subject` on behalf of `client_id`.
    #[must_use]
    pub fn new(subject: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Sets the scopes.
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the audience.
    #[must_use]
    pub fn with_audience(mut self, audience: Audience) -> Self {
        self.audience = Some(audience);
        self
    }

    /// Sets the resource indicators.
    #[must_use]
    pub fn with_resource(mut self, resource: Vec<String>) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Sets the confirmation claim.
    #[must_use]
    pub fn with_confirmation(mut self, confirmation: Confirmation) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    /// Sets the lifetime.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Adds custom claims.
    #[must_use]
    pub fn with_extra_claims(mut self, extra: BTreeMap<String, Value>) -> Self {
        self.extra_claims.extend(extra);
        self
    }
}

// ============================================================================
// JWT Service
// ============================================================================

/// Service for minting and verifying JWT access tokens.
///
/// This service is thread-safe (`Send + Sync`) and can be shared across
/// async tasks.
pub struct JwtService {
    keys: HashMap<String, SigningKeyPair>,
    signing_kid: String,
    issuer: String,
    allowed_algorithms: Vec<SigningAlgorithm>,
    default_audience: Option<String>,
    default_ttl: Duration,
    leeway: Duration,
    clock: Arc<dyn Clock>,
}

impl JwtService {
    /// Creates a new JWT service that signs with `signing_key`.
    ///
    /// Only the signing key's algorithm is allowed until
    /// [`with_allowed_algorithms`](Self::with_allowed_algorithms) widens it.
    #[must_use]
    pub fn new(signing_key: SigningKeyPair, issuer: impl Into<String>) -> Self {
        let signing_kid = signing_key.kid.clone();
        let allowed_algorithms = vec![signing_key.algorithm];
        Self {
            keys: HashMap::from([(signing_kid.clone(), signing_key)]),
            signing_kid,
            issuer: issuer.into(),
            allowed_algorithms,
            default_audience: None,
            default_ttl: Duration::from_secs(3600),
            leeway: Duration::ZERO,
            clock: Arc::new(SystemClock),
        }
    }

    /// Creates a service from the token configuration.
    ///
    /// # Errors
    /// Returns an error if the configured algorithms are invalid or the
    /// signing key's algorithm is not the configured one.
    pub fn from_config(
        config: &TokenSecurityConfig,
        signing_key: SigningKeyPair,
    ) -> Result<Self, JwtError> {
        let configured = config
            .signing_algorithm()
            .map_err(|e| JwtError::unsupported_algorithm(e.to_string()))?;
        if signing_key.algorithm != configured {
            return Err(JwtError::invalid_key(format!(
                "signing key uses {}, configuration requires {configured}",
                signing_key.algorithm
            )));
        }
        let allowed = config
            .allowed_algorithms()
            .map_err(|e| JwtError::unsupported_algorithm(e.to_string()))?;

        let mut service = Self::new(signing_key, config.token.issuer.clone())
            .with_allowed_algorithms(allowed)?
            .with_default_ttl(config.token.access_token_lifetime)
            .with_leeway(config.token.leeway);
        service.default_audience = config.token.default_audience.clone();
        Ok(service)
    }

    /// Replaces the validation allow-list.
    ///
    /// # Errors
    /// Returns an error if the signing key's algorithm is not in the list.
    pub fn with_allowed_algorithms(
        mut self,
        allowed: Vec<SigningAlgorithm>,
    ) -> Result<Self, JwtError> {
        let signing_alg = self.signing_key().algorithm;
        if !allowed.contains(&signing_alg) {
            return Err(JwtError::unsupported_algorithm(signing_alg.as_str()));
        }
        self.allowed_algorithms = allowed;
        Ok(self)
    }

    /// Adds a key that is accepted for verification only.
    #[must_use]
    pub fn with_verification_key(mut self, key: SigningKeyPair) -> Self {
        self.keys.insert(key.kid.clone(), key);
        self
    }

    /// Sets the audience used when a request has none.
    #[must_use]
    pub fn with_default_audience(mut self, audience: impl Into<String>) -> Self {
        self.default_audience = Some(audience.into());
        self
    }

    /// Sets the default token lifetime.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the clock skew tolerance.
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Sets the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mints a signed access token.
    ///
    /// # Errors
    /// Returns an error if no audience can be determined, a custom claim
    /// uses a reserved name, or signing fails.
    pub fn issue(&self, request: TokenRequest) -> Result<(String, AccessTokenClaims), JwtError> {
        let audience = request
            .audience
            .filter(|aud| !aud.is_empty())
            .or_else(|| self.default_audience.clone().map(Audience::Single))
            .or_else(|| {
                request
                    .resource
                    .clone()
                    .filter(|r| !r.is_empty())
                    .map(Audience::from_vec)
            })
            .ok_or_else(|| JwtError::missing_claim("aud"))?;

        let mut builder =
            AccessTokenClaims::builder(&self.issuer, request.subject, request.client_id)
                .audience(audience)
                .issued_at(self.clock.now())
                .lifetime(request.ttl.unwrap_or(self.default_ttl))
                .scopes(&request.scopes)
                .extra_claims(request.extra_claims);
        if let Some(resource) = request.resource {
            builder = builder.resource(resource);
        }
        if let Some(cnf) = request.confirmation.filter(|cnf| !cnf.is_empty()) {
            builder = builder.confirmation(cnf);
        }
        let claims = builder.build()?;

        let token = self.encode(&claims)?;
        Ok((token, claims))
    }

    /// Encodes claims into a JWT string with the signing key.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn encode<T: Serialize>(&self, claims: &T) -> Result<String, JwtError> {
        let key = self.signing_key();
        let mut header = Header::new(key.algorithm.to_jwt_algorithm());
        header.typ = Some(ACCESS_TOKEN_TYP.to_string());
        header.kid = Some(key.kid.clone());

        encode(&header, claims, &key.encoding_key)
            .map_err(|e| JwtError::encoding_error(e.to_string()))
    }

    /// Returns the public keys as a JWKS document.
    #[must_use]
    pub fn jwks(&self) -> Jwks {
        let mut keys: Vec<Jwk> = self.keys.values().filter_map(SigningKeyPair::to_jwk).collect();
        keys.sort_by(|a, b| a.kid.cmp(&b.kid));
        Jwks { keys }
    }

    /// Returns the current signing key ID.
    #[must_use]
    pub fn current_kid(&self) -> &str {
        &self.signing_kid
    }

    /// Returns the issuer URL.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Returns the validation allow-list.
    #[must_use]
    pub fn allowed_algorithms(&self) -> &[SigningAlgorithm] {
        &self.allowed_algorithms
    }

    /// Returns the default token lifetime.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub(crate) fn leeway(&self) -> Duration {
        self.leeway
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Resolves the verification key for a header `kid`.
    pub(crate) fn verification_key(&self, kid: Option<&str>) -> Option<&SigningKeyPair> {
        match kid {
            Some(kid) => self.keys.get(kid),
            None => Some(self.signing_key()),
        }
    }

    fn signing_key(&self) -> &SigningKeyPair {
        // `signing_kid` is inserted at construction and never removed.
        &self.keys[&self.signing_kid]
    }
}

impl fmt::Debug for JwtService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtService")
            .field("issuer", &self.issuer)
            .field("signing_kid", &self.signing_kid)
            .field("allowed_algorithms", &self.allowed_algorithms)
            .finish_non_exhaustive()
    }
}
