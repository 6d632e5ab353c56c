//! # tessera-auth
//!
//! OAuth 2.0 token security core.
//!
//! This crate provides:
//! - JWT access tokens (RFC 9068) with an algorithm allow-list
//! - Certificate-bound tokens over mutual TLS (RFC 8705)
//! - Encrypted token storage with integrity hashes and key rotation
//! - Token introspection (RFC 7662) and revocation (RFC 7009)
//!
//! ## Overview
//!
//! [`token::TokenLifecycleService`] is the entry point. It mints a token with
//! [`token::JwtService`], binds it to the client certificate when one is
//! presented, and persists a record through [`storage::EncryptedTokenStore`]
//! before returning it. Introspection re-checks the signature, the stored
//! revocation state and the certificate binding on every call.
//!
//! ## Modules
//!
//! - [`config`] - Typed, validated configuration
//! - [`crypto`] - Key manager, encryption levels and integrity hashes
//! - [`mtls`] - Certificate parsing, thumbprints and binding checks
//! - [`token`] - JWT issuance, validation and the lifecycle service
//! - [`storage`] - Encrypted token store and repository traits
//! - [`types`] - Shared domain types
//! - [`discovery`] - Authorization server metadata
//! - [`clock`] - Time source abstraction

pub mod clock;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod mtls;
pub mod storage;
pub mod token;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, TokenSecurityConfig};
pub use discovery::DiscoveryMetadata;
pub use error::{AuthError, ErrorCategory};
pub use storage::{
    ClientRegistry, EncryptedTokenStore, RetrieveOutcome, RotationReport, TokenRepository,
};
pub use token::{IssueRequest, IssuedToken, TokenLifecycleService};

/// Type alias for token security results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tessera_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{ConfigError, TokenSecurityConfig};
    pub use crate::crypto::{EncryptionLevel, KeyManager, KeyProvider, KeyVersion};
    pub use crate::discovery::DiscoveryMetadata;
    pub use crate::error::{AuthError, ErrorCategory};
    pub use crate::mtls::{CertificateFetcher, CertificateInfo, CertificateValidator};
    pub use crate::storage::{
        ClientRegistry, EncryptedTokenRecord, EncryptedTokenStore, InMemoryClientRegistry,
        InMemoryTokenRepository, RetrieveOutcome, RotationReport, TokenPayload, TokenRepository,
        TokenType,
    };
    pub use crate::token::{
        AccessTokenClaims, Confirmation, InactiveReason, IntrospectionOutcome,
        IntrospectionResponse, IssueRequest, IssuedToken, JwtService, SigningAlgorithm,
        SigningKeyPair, TokenLifecycleService, ValidationOptions,
    };
    pub use crate::types::{CertificateBinding, RegisteredClient};
}
