//! Access token minting, validation and lifecycle.
//!
//! This module provides:
//!
//! - JWT access tokens (RFC 9068) and their claims
//! - Signature and claim validation
//! - Token introspection (RFC 7662)
//! - Token revocation (RFC 7009)
//! - The lifecycle service tying issuance, binding and storage together

pub mod claims;
pub mod introspection;
pub mod jwt;
pub mod lifecycle;
pub mod revocation;
pub mod validation;

pub use claims::{AccessTokenClaims, AccessTokenClaimsBuilder, Audience, Confirmation};
pub use introspection::{
    InactiveReason, IntrospectionOutcome, IntrospectionRequest, IntrospectionResponse,
};
pub use jwt::{Jwk, Jwks, JwtError, JwtService, SigningAlgorithm, SigningKeyPair, TokenRequest};
pub use lifecycle::{IssueRequest, IssuedToken, TokenLifecycleService};
pub use revocation::{RevocationReason, RevocationRequest, TokenTypeHint};
pub use validation::{TokenValidationError, ValidationOptions, ValidationOutcome};
