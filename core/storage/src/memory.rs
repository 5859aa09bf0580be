//! In-memory cache and remote transport for testing and tooling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crate::provider::{LocalCache, RemoteSnapshot, RemoteTransport};
use fieldsync_common::{now_millis, EntityKey, Error, Result, Snapshot, Timestamp};

/// In-memory cache entry. `value` is `None` for a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Option<Snapshot>,
    pub timestamp: Timestamp,
}

fn poisoned(what: &str) -> Error {
    Error::Storage(format!("{} lock poisoned", what))
}

/// In-memory local cache.
///
/// Removals leave a tombstone so that the deletion time stays readable.
/// All data is lost on drop unless exported with [`MemoryCache::to_json`].
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    writes: AtomicUsize,
}

impl MemoryCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Seed a tombstone, as if the key had been removed at `timestamp`.
    pub fn insert_tombstone(&self, key: &str, timestamp: Timestamp) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned("cache"))?;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: None,
                timestamp,
            },
        );
        Ok(())
    }

    /// Number of `set`/`remove` calls since creation.
    ///
    /// Seeding through [`MemoryCache::insert_tombstone`] or
    /// [`MemoryCache::from_json`] is not counted.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of live (non-tombstone) entries.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|e| e.values().filter(|entry| entry.value.is_some()).count())
            .unwrap_or(0)
    }

    /// Check if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export all entries, tombstones included, as JSON.
    pub fn to_json(&self) -> Result<String> {
        let entries = self.entries.read().map_err(|_| poisoned("cache"))?;
        let sorted: BTreeMap<&String, &CacheEntry> = entries.iter().collect();
        Ok(serde_json::to_string_pretty(&sorted)?)
    }

    /// Load a cache from JSON produced by [`MemoryCache::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: HashMap<String, CacheEntry> = serde_json::from_str(json)?;
        Ok(Self {
            entries: RwLock::new(entries),
            writes: AtomicUsize::new(0),
        })
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        let entries = self.entries.read().map_err(|_| poisoned("cache"))?;
        Ok(entries.get(key).and_then(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Snapshot, timestamp: Timestamp) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned("cache"))?;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: Some(value),
                timestamp,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned("cache"))?;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: None,
                timestamp: now_millis(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(|_| poisoned("cache"))?;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.value.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_timestamp(&self, key: &str) -> Result<Option<Timestamp>> {
        let entries = self.entries.read().map_err(|_| poisoned("cache"))?;
        Ok(entries.get(key).map(|entry| entry.timestamp))
    }

    async fn forget_tombstone(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned("cache"))?;
        if entries.get(key).is_some_and(|entry| entry.value.is_none()) {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Injected failure for [`MemoryRemote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFailure {
    /// No connectivity.
    Offline,
    /// Server answered with an error status.
    ServerError(u16),
}

/// In-memory remote replica.
///
/// Supports failure and latency injection for exercising the deferral
/// and timeout paths.
pub struct MemoryRemote {
    records: RwLock<HashMap<String, RemoteSnapshot>>,
    failure: Mutex<Option<RemoteFailure>>,
    latency: Mutex<Duration>,
    get_calls: AtomicUsize,
}

impl MemoryRemote {
    /// Create a new empty remote.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            failure: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            get_calls: AtomicUsize::new(0),
        }
    }

    /// Seed a record without going through `put`.
    pub fn insert(&self, key: &EntityKey, data: Snapshot, modified: Timestamp) -> Result<()> {
        let mut records = self.records.write().map_err(|_| poisoned("remote"))?;
        records.insert(key.to_cache_key(), RemoteSnapshot { data, modified });
        Ok(())
    }

    /// Read a record directly.
    pub fn record(&self, key: &EntityKey) -> Option<RemoteSnapshot> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(&key.to_cache_key()).cloned())
    }

    /// Make every subsequent call fail, or clear the failure with `None`.
    pub fn set_failure(&self, failure: Option<RemoteFailure>) {
        if let Ok(mut current) = self.failure.lock() {
            *current = failure;
        }
    }

    /// Delay every subsequent call.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    /// Number of `get` calls since creation.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Export all records as JSON.
    pub fn to_json(&self) -> Result<String> {
        let records = self.records.read().map_err(|_| poisoned("remote"))?;
        let sorted: BTreeMap<&String, &RemoteSnapshot> = records.iter().collect();
        Ok(serde_json::to_string_pretty(&sorted)?)
    }

    /// Load a remote from JSON produced by [`MemoryRemote::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        let records: HashMap<String, RemoteSnapshot> = serde_json::from_str(json)?;
        let remote = Self::new();
        *remote.records.write().map_err(|_| poisoned("remote"))? = records;
        Ok(remote)
    }

    async fn simulate_transport(&self, key: &EntityKey) -> Result<()> {
        let latency = self.latency.lock().map(|l| *l).unwrap_or(Duration::ZERO);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failure = self.failure.lock().map(|f| *f).unwrap_or(None);
        match failure {
            None => Ok(()),
            Some(RemoteFailure::Offline) => {
                Err(Error::Network(format!("No connectivity fetching {}", key)))
            }
            Some(RemoteFailure::ServerError(status)) => Err(Error::Network(format!(
                "Server returned {} for {}",
                status, key
            ))),
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &EntityKey) -> Result<RemoteSnapshot> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_transport(key).await?;

        let records = self.records.read().map_err(|_| poisoned("remote"))?;
        records
            .get(&key.to_cache_key())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Entity not found: {}", key)))
    }

    async fn put(
        &self,
        key: &EntityKey,
        data: Snapshot,
        modified: Timestamp,
    ) -> Result<RemoteSnapshot> {
        self.simulate_transport(key).await?;

        let snapshot = RemoteSnapshot { data, modified };
        let mut records = self.records.write().map_err(|_| poisoned("remote"))?;
        records.insert(key.to_cache_key(), snapshot.clone());
        Ok(snapshot)
    }

    async fn delete(&self, key: &EntityKey) -> Result<()> {
        self.simulate_transport(key).await?;

        let mut records = self.records.write().map_err(|_| poisoned("remote"))?;
        match records.remove(&key.to_cache_key()) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("Entity not found: {}", key))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(id: &str) -> EntityKey {
        EntityKey::new("task", id).unwrap()
    }

    #[tokio::test]
    async fn test_cache_set_and_get() {
        let cache = MemoryCache::new();
        cache.set("task:1", json!({"v": 1}), 1000).await.unwrap();

        assert_eq!(cache.get("task:1").await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(cache.get_timestamp("task:1").await.unwrap(), Some(1000));
        assert_eq!(cache.write_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_remove_leaves_tombstone() {
        let cache = MemoryCache::new();
        cache.set("task:1", json!({"v": 1}), 1000).await.unwrap();
        cache.remove("task:1").await.unwrap();

        assert_eq!(cache.get("task:1").await.unwrap(), None);
        let ts = cache.get_timestamp("task:1").await.unwrap().unwrap();
        assert!(ts >= 1000);
        assert!(cache.list_by_prefix("task:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_forget_tombstone_only_drops_removals() {
        let cache = MemoryCache::new();
        cache.set("task:1", json!({"v": 1}), 1000).await.unwrap();
        cache.insert_tombstone("task:2", 3000).unwrap();

        cache.forget_tombstone("task:1").await.unwrap();
        cache.forget_tombstone("task:2").await.unwrap();
        cache.forget_tombstone("task:3").await.unwrap();

        assert_eq!(cache.get("task:1").await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(cache.get_timestamp("task:2").await.unwrap(), None);
        assert_eq!(cache.write_count(), 1);
        assert!(!cache.to_json().unwrap().contains("task:2"));
    }

    #[tokio::test]
    async fn test_cache_list_by_prefix() {
        let cache = MemoryCache::new();
        cache.set("task:2", json!(2), 1).await.unwrap();
        cache.set("task:1", json!(1), 1).await.unwrap();
        cache.set("route:1", json!(1), 1).await.unwrap();
        cache.insert_tombstone("task:3", 5).unwrap();

        let keys = cache.list_by_prefix("task:").await.unwrap();
        assert_eq!(keys, vec!["task:1".to_string(), "task:2".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_json_export() {
        let cache = MemoryCache::new();
        cache.set("task:1", json!({"v": 1}), 1000).await.unwrap();
        cache.insert_tombstone("task:2", 3000).unwrap();

        let restored = MemoryCache::from_json(&cache.to_json().unwrap()).unwrap();
        assert_eq!(restored.get("task:1").await.unwrap(), Some(json!({"v": 1})));
        assert_eq!(restored.get_timestamp("task:2").await.unwrap(), Some(3000));
        assert_eq!(restored.write_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_not_found_is_distinct() {
        let remote = MemoryRemote::new();
        let err = remote.get(&key("missing")).await.unwrap_err();
        assert!(err.is_not_found());

        remote.set_failure(Some(RemoteFailure::Offline));
        let err = remote.get(&key("missing")).await.unwrap_err();
        assert!(err.is_transport_failure());
        assert_eq!(remote.get_calls(), 2);
    }

    #[tokio::test]
    async fn test_remote_put_and_delete() {
        let remote = MemoryRemote::new();
        remote.put(&key("1"), json!({"v": 1}), 10).await.unwrap();
        assert_eq!(remote.get(&key("1")).await.unwrap().modified, 10);

        remote.delete(&key("1")).await.unwrap();
        assert!(remote.record(&key("1")).is_none());
        assert!(remote.delete(&key("1")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remote_server_error() {
        let remote = MemoryRemote::new();
        remote.insert(&key("1"), json!(1), 1).unwrap();
        remote.set_failure(Some(RemoteFailure::ServerError(503)));

        let err = remote.get(&key("1")).await.unwrap_err();
        assert!(err.to_string().contains("503"));

        remote.set_failure(None);
        assert!(remote.get(&key("1")).await.is_ok());
    }
}
