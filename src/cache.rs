use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::models::{OwnerRecord, Result};
use crate::store::DocumentStore;

struct CachedOwner {
    owner: Option<OwnerRecord>,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Memoizes seller lookups by id for `ttl`. Not-found results are cached too.
pub struct OwnerCache {
    store: Arc<dyn DocumentStore>,
    collection: String,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedOwner>>,
    stats: Mutex<CacheStats>,
}

impl OwnerCache {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            collection: collection.into(),
            ttl,
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub async fn get_owner(&self, owner_id: &str) -> Result<Option<OwnerRecord>> {
        // Never hold the guard across the store await.
        let cached = {
            let entries = self.entries.lock().expect("Owner cache mutex poisoned");
            entries
                .get(owner_id)
                .filter(|e| e.fetched_at.elapsed() < self.ttl)
                .map(|e| e.owner.clone())
        };
        if let Some(owner) = cached {
            self.stats.lock().expect("Owner cache mutex poisoned").hits += 1;
            return Ok(owner);
        }

        self.stats.lock().expect("Owner cache mutex poisoned").misses += 1;
        let owner = match self.store.get_by_id(&self.collection, owner_id).await? {
            Some(doc) => Some(OwnerRecord::from_document(doc)?),
            None => None,
        };

        tracing::debug!(owner_id, found = owner.is_some(), "Owner cache fill");
        let mut entries = self.entries.lock().expect("Owner cache mutex poisoned");
        entries.insert(
            owner_id.to_string(),
            CachedOwner { owner: owner.clone(), fetched_at: Instant::now() },
        );
        Ok(owner)
    }

    pub fn invalidate(&self, owner_id: &str) {
        let removed = self
            .entries
            .lock()
            .expect("Owner cache mutex poisoned")
            .remove(owner_id)
            .is_some();
        self.stats.lock().expect("Owner cache mutex poisoned").invalidations += 1;
        tracing::debug!(owner_id, removed, "Owner cache invalidated");
    }

    pub fn clear(&self) {
        self.entries.lock().expect("Owner cache mutex poisoned").clear();
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().expect("Owner cache mutex poisoned")
    }
}
