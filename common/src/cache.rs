//! Optional in-memory cache layer for intermediate data.
//!
//! When enabled, map tasks publish shuffle fragments here instead of the
//! backing filesystem, and reduce tasks consume them from here. Keys are the
//! same path strings the filesystem would have used, so the two layers stay
//! interchangeable.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use globset::Glob;
use serde::Deserialize;

/// Which cache implementation to run, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    None,
    Memory,
}

/// Key-value capability set for intermediate fragments.
#[async_trait]
pub trait CacheSystem: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Keys matching a glob pattern, in deterministic order.
    async fn list(&self, pattern: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop every entry.
    async fn clear(&self) -> Result<()>;
}

/// Construct the cache selected by configuration, if any.
pub fn new_cache_system(kind: CacheKind) -> Option<Arc<dyn CacheSystem>> {
    match kind {
        CacheKind::None => None,
        CacheKind::Memory => Some(Arc::new(InMemoryCache::with_capacity(64))),
    }
}

/// Process-local cache. Only useful when map and reduce tasks share the
/// process, i.e. with the local executor.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, Bytes>,
}

impl InMemoryCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
        }
    }
}

#[async_trait]
impl CacheSystem for InMemoryCache {
    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = Glob::new(pattern)
            .map_err(|e| anyhow!("bad cache glob {:?}: {}", pattern, e))?
            .compile_matcher();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| matcher.is_match(k))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_cache_by_kind() {
        assert!(new_cache_system(CacheKind::None).is_none());
        assert!(new_cache_system(CacheKind::Memory).is_some());
    }

    #[tokio::test]
    async fn put_get_list_clear() {
        let cache = InMemoryCache::with_capacity(10);
        cache.put("/w/intermediate-m0-r1", Bytes::from("a")).await.unwrap();
        cache.put("/w/intermediate-m1-r1", Bytes::from("b")).await.unwrap();
        cache.put("/w/intermediate-m0-r2", Bytes::from("c")).await.unwrap();

        assert_eq!(
            cache.get("/w/intermediate-m0-r1").await.unwrap(),
            Some(Bytes::from("a"))
        );
        assert_eq!(cache.get("/w/missing").await.unwrap(), None);

        let keys = cache.list("/w/intermediate-m*-r1").await.unwrap();
        assert_eq!(keys, vec!["/w/intermediate-m0-r1", "/w/intermediate-m1-r1"]);

        cache.clear().await.unwrap();
        assert!(cache.list("/w/*").await.unwrap().is_empty());
    }
}
