//! In-memory client store for single-process operation and tests.
//!
//! Same semantics as the database store: updates keep `first_request`,
//! reads purge expired records, reset returns what it removed. State is not
//! persisted across restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::backend::{
    expires_at, validate_key, ClientRecord, ClientStore, ClientValue, StoreResult,
};

/// In-memory client store. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryClientStore {
    records: Arc<RwLock<HashMap<String, ClientRecord>>>,
}

impl MemoryClientStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired ones included.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ClientStore for MemoryClientStore {
    async fn set(
        &self,
        key: &str,
        value: &ClientValue,
        lifetime: Option<Duration>,
    ) -> StoreResult<()> {
        validate_key(key)?;
        let expires = expires_at(Utc::now(), lifetime);
        let mut records = self.records.write().await;

        records
            .entry(key.to_string())
            .and_modify(|record| {
                record.count = value.count;
                record.last_request = value.last_request;
                record.expires = expires;
            })
            .or_insert_with(|| ClientRecord::from_value(key, value, expires));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<ClientRecord>> {
        let now = Utc::now();
        {
            let records = self.records.read().await;
            match records.get(key) {
                None => return Ok(None),
                Some(record) if !record.is_expired_at(now) => return Ok(Some(record.clone())),
                Some(_) => {}
            }
        }

        // Re-check under the write lock; a concurrent set may have refreshed it
        let mut records = self.records.write().await;
        match records.get(key) {
            Some(record) if record.is_expired_at(now) => {
                records.remove(key);
                Ok(None)
            }
            other => Ok(other.cloned()),
        }
    }

    async fn reset(&self, key: &str) -> StoreResult<Option<ClientRecord>> {
        Ok(self.records.write().await.remove(key))
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryClientStore::new();
        let now = Utc::now();
        store.set("1.2.3.4", &ClientValue::first(now), None).await.unwrap();

        let record = store.get("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(record.value(), ClientValue::first(now));
        assert!(record.expires.is_none());
        assert!(store.get("5.6.7.8").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_first_request() {
        let store = MemoryClientStore::new();
        let t0 = Utc::now() - chrono::TimeDelta::seconds(5);
        store.set("1.2.3.4", &ClientValue::first(t0), None).await.unwrap();
        store.increment("1.2.3.4", None).await.unwrap();

        let record = store.get("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.first_request, t0);
        assert!(record.last_request > t0);
    }

    #[tokio::test]
    async fn test_expired_record_removed_on_get() {
        let store = MemoryClientStore::new();
        store
            .set(
                "1.2.3.4",
                &ClientValue::first(Utc::now()),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert!(store.get("1.2.3.4").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.len().await, 1);
        assert!(store.get("1.2.3.4").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_reset_and_purge() {
        let store = MemoryClientStore::new();
        let now = Utc::now();
        store.set("a", &ClientValue::first(now), None).await.unwrap();
        store
            .set("b", &ClientValue::first(now), Some(Duration::from_millis(10)))
            .await
            .unwrap();

        let reset = store.reset("a").await.unwrap().unwrap();
        assert_eq!(reset.id, "a");
        assert!(store.reset("a").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.is_empty().await);
    }
}
