//! Client registry trait.
//!
//! The token core only reads client registrations. Creating and editing
//! clients belongs to whatever system owns them.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::AuthResult;
use crate::types::RegisteredClient;

// =============================================================================
// Client Registry Trait
// =============================================================================

/// Read access to registered OAuth 2.0 clients.
///
/// # Example
///
/// ```ignore
/// use tessera_auth::storage::ClientRegistry;
///
/// async fn example(registry: &impl ClientRegistry) {
///     if let Some(client) = registry.find_by_client_id("my-app").await? {
///         println!("certificate bound: {}", client.requires_certificate());
///     }
/// }
/// ```
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Find a client by its OAuth client_id.
    ///
    /// Inactive clients are returned as-is; callers check `active`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    async fn find_by_client_id(&self, client_id: &str) -> AuthResult<Option<RegisteredClient>>;
}

// =============================================================================
// In-Memory Registry
// =============================================================================

/// [`ClientRegistry`] holding clients in memory.
#[derive(Debug, Default)]
pub struct InMemoryClientRegistry {
    clients: DashMap<String, RegisteredClient>,
}

impl InMemoryClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a client.
    pub fn register(&self, client: RegisteredClient) {
        self.clients.insert(client.client_id.clone(), client);
    }

    /// Removes a client, returning it if present.
    pub fn remove(&self, client_id: &str) -> Option<RegisteredClient> {
        self.clients.remove(client_id).map(|(_, client)| client)
    }
}

impl FromIterator<RegisteredClient> for InMemoryClientRegistry {
    fn from_iter<I: IntoIterator<Item = RegisteredClient>>(iter: I) -> Self {
        let registry = Self::new();
        for client in iter {
            registry.register(client);
        }
        registry
    }
}

#[async_trait]
impl ClientRegistry for InMemoryClientRegistry {
    async fn find_by_client_id(&self, client_id: &str) -> AuthResult<Option<RegisteredClient>> {
        Ok(self.clients.get(client_id).map(|c| c.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_find() {
        let registry: InMemoryClientRegistry = [
            RegisteredClient::new("c1").with_scopes(["read"]),
            RegisteredClient::new("c2").deactivated(),
        ]
        .into_iter()
        .collect();

        let c1 = registry.find_by_client_id("c1").await.unwrap().unwrap();
        assert!(c1.is_scope_allowed("read"));

        let c2 = registry.find_by_client_id("c2").await.unwrap().unwrap();
        assert!(!c2.active);

        assert!(registry.remove("c1").is_some());
        assert!(registry.find_by_client_id("c1").await.unwrap().is_none());
    }
}
