//! Collaborator traits for the local cache and the remote transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fieldsync_common::{EntityKey, Result, Snapshot, Timestamp};

/// Local key-value record cache.
///
/// Keys are `"{entity_type}:{id}"`. Every write carries the mutation
/// timestamp, which stays readable after a removal so that local deletions
/// can be ordered against remote edits.
///
/// Implementations must be safe for concurrent access.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// Get the cached snapshot, or `None` if never cached or removed.
    async fn get(&self, key: &str) -> Result<Option<Snapshot>>;

    /// Store a snapshot with its mutation timestamp.
    async fn set(&self, key: &str, value: Snapshot, timestamp: Timestamp) -> Result<()>;

    /// Remove a snapshot.
    ///
    /// # Postconditions
    /// - `get` returns `None`
    /// - `get_timestamp` returns the removal time
    async fn remove(&self, key: &str) -> Result<()>;

    /// List live keys starting with `prefix`.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Last mutation time of a key, including removals.
    async fn get_timestamp(&self, key: &str) -> Result<Option<Timestamp>>;

    /// Drop the removal record of `key` once the remote is gone too.
    ///
    /// Live entries are left alone.
    async fn forget_tombstone(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// A snapshot as held by the remote replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    /// Entity payload.
    pub data: Snapshot,
    /// Last remote mutation time (epoch milliseconds).
    pub modified: Timestamp,
}

/// Remote transport to the authoritative replica.
///
/// # Errors
/// - `Error::NotFound` when the entity does not exist remotely. This is
///   an absence signal and must not be used for any other failure.
/// - `Error::Network` / `Error::Timeout` for connectivity or server
///   failures.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Get the transport name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Fetch the canonical snapshot of an entity.
    async fn get(&self, key: &EntityKey) -> Result<RemoteSnapshot>;

    /// Create or replace an entity.
    async fn put(&self, key: &EntityKey, data: Snapshot, modified: Timestamp)
        -> Result<RemoteSnapshot>;

    /// Delete an entity.
    async fn delete(&self, key: &EntityKey) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_snapshot_serialization() {
        let snapshot = RemoteSnapshot {
            data: json!({"id": 123, "v": 2}),
            modified: 2000,
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        let deserialized: RemoteSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, snapshot);
    }
}
