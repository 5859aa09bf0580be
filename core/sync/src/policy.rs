//! Resolution policy registry.
//!
//! Holds the default strategy, per-conflict-type overrides, per-entity-type
//! merge functions and the optional manual resolver. One registry is built
//! at the composition root and shared by `Arc` with the resolver and the
//! sync engine. Reconfiguration is last-write-wins and only affects
//! resolutions that start after it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use fieldsync_common::{Result, Snapshot};

use crate::conflict::{ConflictDescriptor, ConflictType, ResolutionOutcome, ResolutionStrategy};

/// Default bound on waiting for a manual resolver.
pub const DEFAULT_MANUAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Entity-type merge function.
///
/// Receives both sides as they are, absent ones included, and returns the
/// merged snapshot or `None` to delete the entity.
pub type MergeFn = Arc<dyn Fn(Option<&Snapshot>, Option<&Snapshot>) -> Option<Snapshot> + Send + Sync>;

/// External resolver for the `MANUAL` strategy (e.g. a user prompt).
#[async_trait]
pub trait ManualResolver: Send + Sync {
    /// Decide the outcome of a conflict.
    ///
    /// The outcome is used verbatim, including its `strategy_used`.
    async fn resolve(&self, descriptor: &ConflictDescriptor) -> Result<ResolutionOutcome>;
}

/// Point-in-time copy of everything needed to resolve one conflict.
#[derive(Clone)]
pub struct PolicySnapshot {
    pub strategy: ResolutionStrategy,
    pub merge_fn: Option<MergeFn>,
    pub manual_resolver: Option<Arc<dyn ManualResolver>>,
    pub manual_timeout: Duration,
}

struct PolicyState {
    default_strategy: ResolutionStrategy,
    per_conflict_type: HashMap<ConflictType, ResolutionStrategy>,
    merge_functions: HashMap<String, MergeFn>,
    manual_resolver: Option<Arc<dyn ManualResolver>>,
    manual_timeout: Duration,
}

impl PolicyState {
    fn new(default_strategy: ResolutionStrategy) -> Self {
        Self {
            default_strategy,
            per_conflict_type: HashMap::new(),
            merge_functions: HashMap::new(),
            manual_resolver: None,
            manual_timeout: DEFAULT_MANUAL_TIMEOUT,
        }
    }
}

/// Shared, mutable resolution policy.
pub struct PolicyRegistry {
    state: RwLock<PolicyState>,
}

impl PolicyRegistry {
    /// Create a registry with `LATEST_WINS` as default.
    pub fn new() -> Self {
        Self::with_default_strategy(ResolutionStrategy::default())
    }

    /// Create a registry with the given default strategy.
    pub fn with_default_strategy(strategy: ResolutionStrategy) -> Self {
        Self {
            state: RwLock::new(PolicyState::new(strategy)),
        }
    }

    // Critical sections never panic, so a poisoned lock still holds
    // consistent state.
    fn read(&self) -> RwLockReadGuard<'_, PolicyState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PolicyState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn default_strategy(&self) -> ResolutionStrategy {
        self.read().default_strategy
    }

    pub fn set_default_strategy(&self, strategy: ResolutionStrategy) {
        self.write().default_strategy = strategy;
    }

    /// Override the strategy for one conflict type.
    pub fn set_conflict_strategy(&self, conflict_type: ConflictType, strategy: ResolutionStrategy) {
        self.write().per_conflict_type.insert(conflict_type, strategy);
    }

    /// Remove an override; the type falls back to the default again.
    pub fn clear_conflict_strategy(&self, conflict_type: ConflictType) {
        self.write().per_conflict_type.remove(&conflict_type);
    }

    /// Effective strategy for a conflict type.
    pub fn strategy_for(&self, conflict_type: ConflictType) -> ResolutionStrategy {
        let state = self.read();
        state
            .per_conflict_type
            .get(&conflict_type)
            .copied()
            .unwrap_or(state.default_strategy)
    }

    /// Register (or replace) the merge function for an entity type.
    pub fn register_merge_function<F>(&self, entity_type: impl Into<String>, merge: F)
    where
        F: Fn(Option<&Snapshot>, Option<&Snapshot>) -> Option<Snapshot> + Send + Sync + 'static,
    {
        self.write()
            .merge_functions
            .insert(entity_type.into(), Arc::new(merge));
    }

    pub fn has_merge_function(&self, entity_type: &str) -> bool {
        self.read().merge_functions.contains_key(entity_type)
    }

    pub fn clear_merge_functions(&self) {
        self.write().merge_functions.clear();
    }

    pub fn set_manual_resolver(&self, resolver: Arc<dyn ManualResolver>) {
        self.write().manual_resolver = Some(resolver);
    }

    pub fn has_manual_resolver(&self) -> bool {
        self.read().manual_resolver.is_some()
    }

    pub fn clear_manual_resolver(&self) {
        self.write().manual_resolver = None;
    }

    pub fn manual_timeout(&self) -> Duration {
        self.read().manual_timeout
    }

    /// Bound the wait for a manual resolver before falling back.
    pub fn set_manual_timeout(&self, timeout: Duration) {
        self.write().manual_timeout = timeout;
    }

    /// Restore every setting to its initial value.
    pub fn reset(&self) {
        *self.write() = PolicyState::new(ResolutionStrategy::default());
    }

    /// Capture the policy for one conflict.
    pub fn snapshot(&self, conflict_type: ConflictType, entity_type: Option<&str>) -> PolicySnapshot {
        let state = self.read();
        PolicySnapshot {
            strategy: state
                .per_conflict_type
                .get(&conflict_type)
                .copied()
                .unwrap_or(state.default_strategy),
            merge_fn: entity_type.and_then(|t| state.merge_functions.get(t).cloned()),
            manual_resolver: state.manual_resolver.clone(),
            manual_timeout: state.manual_timeout,
        }
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AlwaysLocal;

    #[async_trait]
    impl ManualResolver for AlwaysLocal {
        async fn resolve(&self, descriptor: &ConflictDescriptor) -> Result<ResolutionOutcome> {
            Ok(ResolutionOutcome::from_option(
                descriptor.local_data().cloned(),
                ResolutionStrategy::Manual,
            ))
        }
    }

    #[test]
    fn test_defaults() {
        let registry = PolicyRegistry::new();
        assert_eq!(registry.default_strategy(), ResolutionStrategy::LatestWins);
        assert!(!registry.has_manual_resolver());
        assert_eq!(registry.manual_timeout(), DEFAULT_MANUAL_TIMEOUT);
    }

    #[test]
    fn test_override_precedence() {
        let registry = PolicyRegistry::with_default_strategy(ResolutionStrategy::RemoteWins);
        registry.set_conflict_strategy(
            ConflictType::LocalDeletedRemoteModified,
            ResolutionStrategy::LocalWins,
        );

        assert_eq!(
            registry.strategy_for(ConflictType::LocalDeletedRemoteModified),
            ResolutionStrategy::LocalWins
        );
        assert_eq!(
            registry.strategy_for(ConflictType::BothModified),
            ResolutionStrategy::RemoteWins
        );

        registry.clear_conflict_strategy(ConflictType::LocalDeletedRemoteModified);
        assert_eq!(
            registry.strategy_for(ConflictType::LocalDeletedRemoteModified),
            ResolutionStrategy::RemoteWins
        );
    }

    #[test]
    fn test_independent_clearing() {
        let registry = PolicyRegistry::new();
        registry.set_default_strategy(ResolutionStrategy::Merge);
        registry.register_merge_function("note", |_, remote| remote.cloned());
        registry.set_manual_resolver(Arc::new(AlwaysLocal));

        registry.clear_merge_functions();
        assert!(!registry.has_merge_function("note"));
        assert!(registry.has_manual_resolver());
        assert_eq!(registry.default_strategy(), ResolutionStrategy::Merge);

        registry.clear_manual_resolver();
        assert!(!registry.has_manual_resolver());
        assert_eq!(registry.default_strategy(), ResolutionStrategy::Merge);
    }

    #[test]
    fn test_reset() {
        let registry = PolicyRegistry::new();
        registry.set_default_strategy(ResolutionStrategy::LocalWins);
        registry.set_conflict_strategy(ConflictType::BothDeleted, ResolutionStrategy::Manual);
        registry.set_manual_timeout(Duration::from_secs(1));

        registry.reset();
        assert_eq!(registry.default_strategy(), ResolutionStrategy::LatestWins);
        assert_eq!(
            registry.strategy_for(ConflictType::BothDeleted),
            ResolutionStrategy::LatestWins
        );
        assert_eq!(registry.manual_timeout(), DEFAULT_MANUAL_TIMEOUT);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let registry = PolicyRegistry::new();
        registry.register_merge_function("note", |_, _| Some(json!("merged")));

        let snapshot = registry.snapshot(ConflictType::BothModified, Some("note"));
        registry.set_default_strategy(ResolutionStrategy::LocalWins);
        registry.clear_merge_functions();

        assert_eq!(snapshot.strategy, ResolutionStrategy::LatestWins);
        let merge = snapshot.merge_fn.expect("captured merge function");
        assert_eq!(merge(None, None), Some(json!("merged")));
    }

    #[test]
    fn test_snapshot_without_entity_type_has_no_merge_fn() {
        let registry = PolicyRegistry::new();
        registry.register_merge_function("note", |_, _| None);
        assert!(registry
            .snapshot(ConflictType::BothModified, None)
            .merge_fn
            .is_none());
    }
}
