//! Entity sync engine: reconciles cached entities against the remote replica.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use fieldsync_common::{now_millis, EntityKey, Error, Result, Snapshot, Timestamp};
use fieldsync_storage::{LocalCache, RemoteTransport};

use crate::conflict::{ConflictDescriptor, ResolutionOutcome, ResolutionStrategy};
use crate::policy::PolicyRegistry;
use crate::resolver::ConflictResolver;

/// Remote timestamp used when the remote reports "not found".
///
/// The transport carries no deletion time, so under `LATEST_WINS` any
/// surviving local edit is newer than a remote deletion.
pub const REMOTE_ABSENT_TIMESTAMP: Timestamp = 0;

/// Local timestamp used for keys the cache has never seen.
pub const LOCAL_UNKNOWN_TIMESTAMP: Timestamp = 0;

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEngineConfig {
    /// Upper bound on simultaneously reconciled entities in a batch.
    pub max_concurrent: usize,
    /// Remote fetch deadline; elapsed fetches are deferred.
    pub fetch_timeout: Duration,
    /// Push the resolved value back to the remote before committing locally.
    pub push_resolved: bool,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            fetch_timeout: Duration::from_secs(30),
            push_resolved: false,
        }
    }
}

/// What happened to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntitySyncOutcome {
    /// Absent locally and remotely.
    NothingToDo,
    /// Both sides equal; cache left as-is.
    Unchanged,
    /// Conflict resolved to a value, written to the cache.
    Resolved { strategy: ResolutionStrategy },
    /// Conflict resolved to a deletion.
    Deleted { strategy: ResolutionStrategy },
    /// Remote fetch failed; cache left as-is for a later attempt.
    Deferred { reason: String },
}

/// Result of syncing one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySyncReport {
    pub key: EntityKey,
    pub outcome: EntitySyncOutcome,
    /// Materialized value after sync, `None` if absent.
    pub value: Option<Snapshot>,
}

impl EntitySyncReport {
    pub fn is_deferred(&self) -> bool {
        matches!(self.outcome, EntitySyncOutcome::Deferred { .. })
    }
}

/// A per-entity failure inside a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFailure {
    pub key: EntityKey,
    pub message: String,
    /// True for deferrals, false for errors.
    pub deferred: bool,
}

/// Result of a batch sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSyncResult {
    /// Reports of entities that completed or were deferred.
    pub reports: Vec<EntitySyncReport>,
    /// Deferrals and errors.
    pub failures: Vec<ItemFailure>,
    pub duration: Duration,
}

impl BatchSyncResult {
    /// Number of entities attempted.
    pub fn attempted(&self) -> usize {
        self.reports.len() + self.failures.iter().filter(|f| !f.deferred).count()
    }

    /// Number of entities reconciled (not deferred, not failed).
    pub fn synced(&self) -> usize {
        self.reports.iter().filter(|r| !r.is_deferred()).count()
    }

    /// Number of entities that resolved a conflict.
    pub fn conflicts_resolved(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    EntitySyncOutcome::Resolved { .. } | EntitySyncOutcome::Deleted { .. }
                )
            })
            .count()
    }

    pub fn deferred(&self) -> usize {
        self.failures.iter().filter(|f| f.deferred).count()
    }

    pub fn failed(&self) -> usize {
        self.failures.iter().filter(|f| !f.deferred).count()
    }
}

/// Reconciles one entity at a time against a single authoritative remote.
///
/// Overlapping calls for the same key are not serialized here; batch
/// callers deduplicate keys before issuing them.
pub struct SyncEngine {
    cache: Arc<dyn LocalCache>,
    remote: Arc<dyn RemoteTransport>,
    resolver: ConflictResolver,
    config: SyncEngineConfig,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(
        cache: Arc<dyn LocalCache>,
        remote: Arc<dyn RemoteTransport>,
        policy: Arc<PolicyRegistry>,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            cache,
            remote,
            resolver: ConflictResolver::new(policy),
            config,
        }
    }

    /// Get the policy registry.
    pub fn policy(&self) -> &Arc<PolicyRegistry> {
        self.resolver.policy()
    }

    /// Get the configuration.
    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// Register a merge function for an entity type.
    pub fn register_merge_function<F>(&self, entity_type: impl Into<String>, merge: F)
    where
        F: Fn(Option<&Snapshot>, Option<&Snapshot>) -> Option<Snapshot> + Send + Sync + 'static,
    {
        self.policy().register_merge_function(entity_type, merge);
    }

    /// Sync one entity and return its materialized value.
    ///
    /// Returns the unchanged local value when the remote fetch fails.
    pub async fn sync_entity(&self, entity_type: &str, id: &str) -> Result<Option<Snapshot>> {
        let key = EntityKey::new(entity_type, id)?;
        Ok(self.sync_entity_detailed(&key).await?.value)
    }

    /// Sync one entity and report what happened.
    ///
    /// # Postconditions
    /// - On `Err`, and on a deferral, the local cache is untouched
    ///
    /// # Errors
    /// - Local cache failures
    /// - Manual resolver failures
    /// - Remote write-back failures (only with `push_resolved`)
    pub async fn sync_entity_detailed(&self, key: &EntityKey) -> Result<EntitySyncReport> {
        let cache_key = key.to_cache_key();

        let local = self.cache.get(&cache_key).await?;
        let local_timestamp = self
            .cache
            .get_timestamp(&cache_key)
            .await?
            .unwrap_or(LOCAL_UNKNOWN_TIMESTAMP);

        let (remote, remote_timestamp) =
            match timeout(self.config.fetch_timeout, self.remote.get(key)).await {
                Ok(Ok(snapshot)) => (Some(snapshot.data), snapshot.modified),
                Ok(Err(e)) if e.is_not_found() => (None, REMOTE_ABSENT_TIMESTAMP),
                Ok(Err(e)) => {
                    warn!("Deferring {}: remote fetch failed: {}", key, e);
                    return Ok(Self::deferred(key, local, e.to_string()));
                }
                Err(_) => {
                    warn!(
                        "Deferring {}: remote fetch timed out after {:?}",
                        key, self.config.fetch_timeout
                    );
                    let reason = Error::Timeout(format!("fetching {}", key)).to_string();
                    return Ok(Self::deferred(key, local, reason));
                }
            };

        match (&local, &remote) {
            (None, None) => {
                debug!("{} absent locally and remotely, nothing to do", key);
                self.cache.forget_tombstone(&cache_key).await?;
                return Ok(EntitySyncReport {
                    key: key.clone(),
                    outcome: EntitySyncOutcome::NothingToDo,
                    value: None,
                });
            }
            (Some(l), Some(r)) if l == r => {
                debug!("{} already in sync", key);
                return Ok(EntitySyncReport {
                    key: key.clone(),
                    outcome: EntitySyncOutcome::Unchanged,
                    value: local,
                });
            }
            _ => {}
        }

        let was_cached = local.is_some();
        let remote_absent = remote.is_none();
        let descriptor = ConflictDescriptor::from_snapshots(
            key.id(),
            local,
            local_timestamp,
            remote,
            remote_timestamp,
        );
        let outcome = self
            .resolver
            .resolve(&descriptor, Some(key.entity_type()))
            .await?;

        if self.config.push_resolved {
            self.push_outcome(key, &descriptor, &outcome).await?;
        }

        let report = self.commit(key, was_cached, outcome).await?;
        if matches!(report.outcome, EntitySyncOutcome::Deleted { .. })
            && (remote_absent || self.config.push_resolved)
        {
            // Deleted on both sides, the removal time is no longer needed
            self.cache.forget_tombstone(&cache_key).await?;
        }
        Ok(report)
    }

    /// Write the resolved outcome to the local cache.
    async fn commit(
        &self,
        key: &EntityKey,
        was_cached: bool,
        outcome: ResolutionOutcome,
    ) -> Result<EntitySyncReport> {
        let cache_key = key.to_cache_key();
        let strategy = outcome.strategy_used();

        match outcome.into_resolved_data() {
            None => {
                if was_cached {
                    self.cache.remove(&cache_key).await?;
                }
                info!("{} resolved to deletion ({})", key, strategy);
                Ok(EntitySyncReport {
                    key: key.clone(),
                    outcome: EntitySyncOutcome::Deleted { strategy },
                    value: None,
                })
            }
            Some(data) => {
                self.cache
                    .set(&cache_key, data.clone(), now_millis())
                    .await?;
                info!("{} resolved ({})", key, strategy);
                Ok(EntitySyncReport {
                    key: key.clone(),
                    outcome: EntitySyncOutcome::Resolved { strategy },
                    value: Some(data),
                })
            }
        }
    }

    /// Bring the remote in line with the outcome when they differ.
    async fn push_outcome(
        &self,
        key: &EntityKey,
        descriptor: &ConflictDescriptor,
        outcome: &ResolutionOutcome,
    ) -> Result<()> {
        match (outcome.resolved_data(), descriptor.remote_data()) {
            (None, None) => Ok(()),
            (None, Some(_)) => match self.remote.delete(key).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            },
            (Some(resolved), Some(remote)) if resolved == remote => Ok(()),
            (Some(resolved), _) => {
                debug!("Pushing resolved value of {} to {}", key, self.remote.name());
                self.remote
                    .put(key, resolved.clone(), now_millis())
                    .await
                    .map(|_| ())
            }
        }
    }

    fn deferred(key: &EntityKey, local: Option<Snapshot>, reason: String) -> EntitySyncReport {
        EntitySyncReport {
            key: key.clone(),
            outcome: EntitySyncOutcome::Deferred { reason },
            value: local,
        }
    }

    /// Sync an explicit set of entities with the configured concurrency.
    pub async fn sync_entities(&self, keys: Vec<EntityKey>) -> BatchSyncResult {
        self.sync_entities_with_limit(keys, self.config.max_concurrent)
            .await
    }

    /// Sync an explicit set of entities with at most `limit` in flight.
    ///
    /// Duplicate keys are synced once.
    pub async fn sync_entities_with_limit(
        &self,
        keys: Vec<EntityKey>,
        limit: usize,
    ) -> BatchSyncResult {
        let start = Instant::now();

        let mut seen = HashSet::new();
        let keys: Vec<EntityKey> = keys
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect();

        info!("Syncing {} entities (max {} in flight)", keys.len(), limit.max(1));

        let results: Vec<(EntityKey, Result<EntitySyncReport>)> = stream::iter(keys)
            .map(|key| async move {
                let result = self.sync_entity_detailed(&key).await;
                (key, result)
            })
            .buffer_unordered(limit.max(1))
            .collect()
            .await;

        let mut batch = BatchSyncResult::default();
        for (key, result) in results {
            match result {
                Ok(report) => {
                    if let EntitySyncOutcome::Deferred { reason } = &report.outcome {
                        batch.failures.push(ItemFailure {
                            key: key.clone(),
                            message: reason.clone(),
                            deferred: true,
                        });
                    }
                    batch.reports.push(report);
                }
                Err(e) => {
                    error!("Failed to sync {}: {}", key, e);
                    batch.failures.push(ItemFailure {
                        key,
                        message: e.to_string(),
                        deferred: false,
                    });
                }
            }
        }

        batch.duration = start.elapsed();
        info!(
            "Batch sync completed in {:?}: {} synced, {} deferred, {} failed",
            batch.duration,
            batch.synced(),
            batch.deferred(),
            batch.failed()
        );
        batch
    }

    /// Sync every cached entity of a type.
    pub async fn sync_all_entities(&self, entity_type: &str) -> Result<BatchSyncResult> {
        let prefix = EntityKey::prefix_for(entity_type);
        let mut keys = Vec::new();
        for cache_key in self.cache.list_by_prefix(&prefix).await? {
            match EntityKey::parse(&cache_key) {
                Ok(key) => keys.push(key),
                Err(e) => warn!("Skipping invalid cache key {}: {}", cache_key, e),
            }
        }

        Ok(self.sync_entities(keys).await)
    }
}
