//! Domain types shared across modules.
//!
//! - [`RegisteredClient`] - The client facts the token core depends on
//! - [`CertificateBinding`] - A client's registered mTLS certificate
//! - [`RefreshToken`] - Opaque refresh token values

pub mod client;
pub mod refresh_token;

pub use client::{CertificateBinding, RegisteredClient};
pub use refresh_token::{RefreshToken, hash_token};
