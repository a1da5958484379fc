//! Read-through, write-through cache in front of any [`KeyStore`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::cache::{CacheStore, ExpiringCache};
use crate::error::Result;
use crate::key_store::{entry_count, unique_id, ClearableKeyStore, KeyData, KeyStore, KeyType};

pub struct CachingKeyStore {
    store: Arc<dyn KeyStore>,
    /// Present only when the backing store was composed with clear support.
    clearable: Option<Arc<dyn ClearableKeyStore>>,
    cache: Arc<dyn CacheStore>,
}

impl CachingKeyStore {
    /// Wrap a store that cannot be cleared, using the default 5 minute cache.
    pub fn new<S>(store: Arc<S>) -> Self
    where
        S: KeyStore + 'static,
    {
        Self::with_cache(store, Arc::new(ExpiringCache::default()))
    }

    pub fn with_cache<S>(store: Arc<S>, cache: Arc<dyn CacheStore>) -> Self
    where
        S: KeyStore + 'static,
    {
        Self {
            store,
            clearable: None,
            cache,
        }
    }

    /// Wrap a store whose contents are dropped along with the cache on `clear`.
    pub fn clearable<S>(store: Arc<S>) -> Self
    where
        S: ClearableKeyStore + 'static,
    {
        Self::clearable_with_cache(store, Arc::new(ExpiringCache::default()))
    }

    pub fn clearable_with_cache<S>(store: Arc<S>, cache: Arc<dyn CacheStore>) -> Self
    where
        S: ClearableKeyStore + 'static,
    {
        Self {
            store: store.clone(),
            clearable: Some(store),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }
}

#[async_trait]
impl KeyStore for CachingKeyStore {
    async fn get(&self, kind: &KeyType, ids: &[String]) -> Result<HashMap<String, Bytes>> {
        let mut data = HashMap::with_capacity(ids.len());
        let mut ids_to_fetch = Vec::new();
        for id in ids {
            match self.cache.get(&unique_id(kind, id)) {
                Some(item) => {
                    data.insert(id.clone(), item);
                }
                None => ids_to_fetch.push(id.clone()),
            }
        }

        if !ids_to_fetch.is_empty() {
            trace!(items = ids_to_fetch.len(), "loading from store");
            let mut fetched = self.store.get(kind, &ids_to_fetch).await?;
            for id in ids_to_fetch {
                if let Some(item) = fetched.remove(&id) {
                    self.cache.set(&unique_id(kind, &id), item.clone());
                    data.insert(id, item);
                }
            }
        }

        Ok(data)
    }

    async fn set(&self, data: KeyData) -> Result<()> {
        for (kind, entries) in &data {
            for (id, value) in entries {
                let key = unique_id(kind, id);
                match value {
                    Some(value) => self.cache.set(&key, value.clone()),
                    None => self.cache.del(&key),
                }
            }
        }
        trace!(keys = entry_count(&data), "updated cache");

        // The cache is not rolled back if this fails.
        self.store.set(data).await
    }
}

#[async_trait]
impl ClearableKeyStore for CachingKeyStore {
    async fn clear(&self) -> Result<()> {
        self.cache.flush_all();
        if let Some(store) = &self.clearable {
            store.clear().await?;
        }
        Ok(())
    }
}
