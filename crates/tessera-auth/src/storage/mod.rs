//! Token record storage.
//!
//! - [`record`] - Encrypted record layout, payloads and read outcomes
//! - [`repository`] - The persistence trait backends implement
//! - [`memory`] - In-memory repository
//! - [`encrypted`] - The encrypted store: store, retrieve, revoke, rotate
//! - [`client`] - Client registry lookups

pub mod client;
pub mod encrypted;
pub mod memory;
pub mod record;
pub mod repository;

pub use client::{ClientRegistry, InMemoryClientRegistry};
pub use encrypted::{EncryptedTokenStore, RotationReport};
pub use memory::InMemoryTokenRepository;
pub use record::{
    EncryptedTokenRecord, RetrieveOutcome, StoredToken, TokenPayload, TokenType, truncate,
};
pub use repository::TokenRepository;
