#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kgents-store-memory** – In-memory storage driver for kgents.
//!
//! Tier 0 of the projection lattice: a plain in-process map. Fastest tier,
//! always available, and entirely ephemeral - everything is lost when the
//! process exits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use kgents_store_core::{Datum, DatumStore, StoreError, StoreStats};

//─────────────────────────────
//  In-memory storage backend
//─────────────────────────────

/// An in-process, non-persistent datum store.
///
/// Point operations are constant-time over a single map guarded by an
/// async `RwLock`. Listing iterates the map, filters, and sorts newest
/// first. Serves as the last-resort fallback tier: its probe never fails.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Datum>>>,
}

impl MemoryStore {
    /// Creates a new, empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every stored datum.
    pub async fn clear(&self) {
        self.data.write().await.clear();
    }
}

#[async_trait]
impl DatumStore for MemoryStore {
    async fn put(&self, datum: &Datum) -> Result<String, StoreError> {
        self.data
            .write()
            .await
            .insert(datum.id.clone(), datum.clone());
        Ok(datum.id.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<Datum>, StoreError> {
        Ok(self.data.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.data.write().await.remove(id).is_some())
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<Datum>, StoreError> {
        let data = self.data.read().await;
        let mut results: Vec<Datum> = data
            .values()
            .filter(|d| prefix.map_or(true, |p| d.id.starts_with(p)))
            .filter(|d| after.map_or(true, |a| d.created_at > a))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));
        results.truncate(limit);
        Ok(results)
    }

    async fn causal_chain(&self, id: &str) -> Result<Vec<Datum>, StoreError> {
        let data = self.data.read().await;
        let Some(datum) = data.get(id) else {
            return Ok(Vec::new());
        };

        let mut chain = vec![datum.clone()];
        let mut current = datum;
        while let Some(parent_id) = &current.causal_parent {
            // Stop at the first missing ancestor (orphaned datum).
            let Some(parent) = data.get(parent_id) else {
                break;
            };
            chain.push(parent.clone());
            current = parent;
        }

        chain.reverse();
        Ok(chain)
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.data.read().await.contains_key(id))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.data.read().await.len() as u64)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let data = self.data.read().await;
        Ok(StoreStats {
            total_datums: data.len() as u64,
            size_bytes: data.values().map(|d| d.size() as u64).sum(),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgents_store_core::Query;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryStore::new();
        let datum = Datum::new(b"hello".to_vec());

        let id = store.put(&datum).await.unwrap();
        assert_eq!(id, datum.id);

        let fetched = store.get(&id).await.unwrap().unwrap();
        assert_eq!(fetched, datum);
    }

    #[tokio::test]
    async fn put_is_idempotent_on_id() {
        let store = MemoryStore::new();
        let datum = Datum::new(b"v1".to_vec());
        store.put(&datum).await.unwrap();

        let replacement = datum.clone().with_metadata([("rev", "2")]);
        store.put(&replacement).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let fetched = store.get(&datum.id).await.unwrap().unwrap();
        assert_eq!(fetched.metadata.get("rev").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn content_addressed_puts_deduplicate() {
        let store = MemoryStore::new();
        let a = Datum::content_addressed(b"hello".to_vec());
        let b = Datum::content_addressed(b"hello".to_vec());

        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_returns_whether_it_existed() {
        let store = MemoryStore::new();
        let datum = Datum::new(b"gone".to_vec());
        store.put(&datum).await.unwrap();

        assert!(store.delete(&datum.id).await.unwrap());
        assert!(!store.delete(&datum.id).await.unwrap());
        assert!(store.get(&datum.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_newest_first_with_filters() {
        let store = MemoryStore::new();
        let old = Datum::new(b"old".to_vec()).with_id("aa-old");
        let new = Datum::new(b"new".to_vec()).with_id("aa-new");
        let other = Datum::new(b"other".to_vec()).with_id("zz-other");
        for d in [&old, &new, &other] {
            store.put(d).await.unwrap();
        }

        let all = store.list(None, None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].created_at > all[1].created_at);

        let prefixed = store.list(Some("aa"), None, 10).await.unwrap();
        assert_eq!(prefixed.len(), 2);

        let recent = store.list(None, Some(old.created_at), 10).await.unwrap();
        assert!(recent.iter().all(|d| d.created_at > old.created_at));

        assert!(store.list(None, None, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn causal_chain_walks_to_the_root() {
        let store = MemoryStore::new();
        let a = Datum::new(b"a".to_vec());
        let b = a.derive(b"b".to_vec());
        let c = b.derive(b"c".to_vec());
        for d in [&a, &b, &c] {
            store.put(d).await.unwrap();
        }

        let chain = store.causal_chain(&c.id).await.unwrap();
        let ids: Vec<&str> = chain.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]);

        // A rootless datum is its own chain.
        assert_eq!(store.causal_chain(&a.id).await.unwrap().len(), 1);
        // Unknown ids yield an empty chain.
        assert!(store.causal_chain("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn causal_chain_stops_at_missing_ancestor() {
        let store = MemoryStore::new();
        let orphan = Datum::new(b"orphan".to_vec()).with_parent("never-stored");
        store.put(&orphan).await.unwrap();

        let chain = store.causal_chain(&orphan.id).await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, orphan.id);
    }

    #[tokio::test]
    async fn query_filters_tags_and_metadata() {
        let store = MemoryStore::new();
        let hit = Datum::new(b"hit".to_vec()).with_metadata([("tags", "a,b"), ("author", "ada")]);
        let miss = Datum::new(b"miss".to_vec()).with_metadata([("tags", "b")]);
        store.put(&hit).await.unwrap();
        store.put(&miss).await.unwrap();

        let results = store
            .query(&Query::new().with_tags(["a"]).with_author("ada"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, hit.id);
    }

    #[tokio::test]
    async fn stats_reports_content_bytes() {
        let store = MemoryStore::new();
        store.put(&Datum::new(vec![0u8; 10])).await.unwrap();
        store.put(&Datum::new(vec![0u8; 5])).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_datums, 2);
        assert_eq!(stats.size_bytes, 15);
    }
}
