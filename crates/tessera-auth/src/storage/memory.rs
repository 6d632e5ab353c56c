//! In-memory token repository.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;

use super::record::EncryptedTokenRecord;
use super::repository::TokenRepository;
use crate::{AuthError, AuthResult};

/// [`TokenRepository`] backed by concurrent maps.
///
/// Suitable for tests and single-process deployments. Records are lost on
/// restart.
#[derive(Debug, Default)]
pub struct InMemoryTokenRepository {
    records: DashMap<String, EncryptedTokenRecord>,
    index: DashMap<String, String>,
    associations: DashMap<String, String>,
}

impl InMemoryTokenRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Overwrites a record without any revision check.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, record: EncryptedTokenRecord) {
        self.records.insert(record.storage_id.clone(), record);
    }

    fn remove_links(&self, storage_id: &str) {
        self.index.retain(|_, target| target != storage_id);
        self.associations.remove(storage_id);
        self.associations.retain(|_, target| target != storage_id);
    }
}

#[async_trait]
impl TokenRepository for InMemoryTokenRepository {
    async fn insert(&self, record: &EncryptedTokenRecord) -> AuthResult<()> {
        match self.records.entry(record.storage_id.clone()) {
            Entry::Occupied(_) => Err(AuthError::storage(format!(
                "record {} already exists",
                record.storage_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, storage_id: &str) -> AuthResult<Option<EncryptedTokenRecord>> {
        Ok(self.records.get(storage_id).map(|r| r.clone()))
    }

    async fn replace_if_revision(
        &self,
        record: &EncryptedTokenRecord,
        expected_revision: u64,
    ) -> AuthResult<bool> {
        let Some(mut current) = self.records.get_mut(&record.storage_id) else {
            return Ok(false);
        };
        if current.revision != expected_revision {
            return Ok(false);
        }
        *current = record.clone();
        Ok(true)
    }

    async fn record_access(&self, storage_id: &str, at: OffsetDateTime) -> AuthResult<()> {
        if let Some(mut record) = self.records.get_mut(storage_id) {
            record.access_count = record.access_count.saturating_add(1);
            record.last_accessed_at = Some(at);
        }
        Ok(())
    }

    async fn delete(&self, storage_id: &str) -> AuthResult<bool> {
        let removed = self.records.remove(storage_id).is_some();
        self.remove_links(storage_id);
        Ok(removed)
    }

    async fn list_stale(
        &self,
        target_version: u32,
        after: Option<&str>,
        limit: usize,
    ) -> AuthResult<Vec<EncryptedTokenRecord>> {
        let mut stale: Vec<EncryptedTokenRecord> = self
            .records
            .iter()
            .filter(|r| r.key_version != target_version)
            .filter(|r| after.is_none_or(|a| r.storage_id.as_str() > a))
            .map(|r| r.clone())
            .collect();
        stale.sort_by(|a, b| a.storage_id.cmp(&b.storage_id));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn count_by_key_version(&self, key_version: u32) -> AuthResult<u64> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.key_version == key_version)
            .count() as u64)
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> AuthResult<u64> {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.storage_id.clone())
            .collect();

        let mut deleted = 0;
        for storage_id in expired {
            if self
                .records
                .remove_if(&storage_id, |_, r| r.is_expired(now))
                .is_some()
            {
                self.remove_links(&storage_id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn index_token(&self, token_hash: &str, storage_id: &str) -> AuthResult<()> {
        match self.index.entry(token_hash.to_string()) {
            Entry::Occupied(_) => Err(AuthError::storage("token hash already indexed")),
            Entry::Vacant(slot) => {
                slot.insert(storage_id.to_string());
                Ok(())
            }
        }
    }

    async fn find_by_token_hash(&self, token_hash: &str) -> AuthResult<Option<String>> {
        Ok(self.index.get(token_hash).map(|s| s.clone()))
    }

    async fn associate(&self, from: &str, to: &str) -> AuthResult<()> {
        self.associations.insert(from.to_string(), to.to_string());
        Ok(())
    }

    async fn find_association(&self, from: &str) -> AuthResult<Option<String>> {
        Ok(self.associations.get(from).map(|s| s.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::tests::sample_record;
    use time::macros::datetime;

    fn record(id: &str, version: u32) -> EncryptedTokenRecord {
        EncryptedTokenRecord {
            storage_id: id.into(),
            key_version: version,
            ..sample_record()
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let repo = InMemoryTokenRepository::new();
        repo.insert(&record("a", 1)).await.unwrap();
        assert!(repo.insert(&record("a", 1)).await.is_err());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_if_revision() {
        let repo = InMemoryTokenRepository::new();
        repo.insert(&record("a", 1)).await.unwrap();

        let mut next = record("a", 2);
        next.revision = 1;
        assert!(repo.replace_if_revision(&next, 0).await.unwrap());
        // Stale writer loses.
        assert!(!repo.replace_if_revision(&next, 0).await.unwrap());
        assert!(!repo.replace_if_revision(&record("missing", 1), 0).await.unwrap());

        let stored = repo.find("a").await.unwrap().unwrap();
        assert_eq!(stored.key_version, 2);
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn test_list_stale_pages_in_order() {
        let repo = InMemoryTokenRepository::new();
        for (id, version) in [("d", 1), ("b", 1), ("c", 2), ("a", 1), ("e", 1)] {
            repo.insert(&record(id, version)).await.unwrap();
        }

        let first = repo.list_stale(2, None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|r| r.storage_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        let second = repo.list_stale(2, Some("b"), 2).await.unwrap();
        let ids: Vec<_> = second.iter().map(|r| r.storage_id.as_str()).collect();
        assert_eq!(ids, ["d", "e"]);

        assert_eq!(repo.count_by_key_version(1).await.unwrap(), 4);
        assert_eq!(repo.count_by_key_version(2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_links() {
        let repo = InMemoryTokenRepository::new();
        repo.insert(&record("access", 1)).await.unwrap();
        repo.insert(&record("refresh", 1)).await.unwrap();
        repo.index_token("h1", "access").await.unwrap();
        repo.associate("refresh", "access").await.unwrap();

        assert!(repo.delete("access").await.unwrap());
        assert!(!repo.delete("access").await.unwrap());
        assert!(repo.find_by_token_hash("h1").await.unwrap().is_none());
        assert!(repo.find_association("refresh").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let repo = InMemoryTokenRepository::new();
        let mut live = record("live", 1);
        live.expires_at = datetime!(2030-01-02 0:00 UTC);
        repo.insert(&live).await.unwrap();
        repo.insert(&record("old", 1)).await.unwrap();

        let deleted = repo
            .delete_expired(datetime!(2030-01-01 12:00 UTC))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.find("old").await.unwrap().is_none());
        assert!(repo.find("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_record_access() {
        let repo = InMemoryTokenRepository::new();
        repo.insert(&record("a", 1)).await.unwrap();
        let at = datetime!(2030-01-01 0:10 UTC);
        repo.record_access("a", at).await.unwrap();
        repo.record_access("a", at).await.unwrap();
        repo.record_access("missing", at).await.unwrap();

        let stored = repo.find("a").await.unwrap().unwrap();
        assert_eq!(stored.access_count, 2);
        assert_eq!(stored.last_accessed_at, Some(at));
    }

    #[tokio::test]
    async fn test_index_is_unique() {
        let repo = InMemoryTokenRepository::new();
        repo.index_token("h", "a").await.unwrap();
        assert!(repo.index_token("h", "b").await.is_err());
        assert_eq!(repo.find_by_token_hash("h").await.unwrap().as_deref(), Some("a"));
    }
}
