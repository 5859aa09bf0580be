//! FieldSync Sync Engine
//!
//! This module reconciles locally cached entities with a remote source of
//! truth, including:
//! - Conflict classification and pluggable resolution policies
//! - Per-entity orchestration with deferral on transport failure
//! - A pending queue with item priorities
//! - Scheduling with device-condition gates and single-flight sessions
//! - Session retry with exponential backoff

pub mod config;
pub mod conflict;
pub mod device;
pub mod engine;
pub mod events;
pub mod policy;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use config::{
    JsonFileSchedulerStore, MemorySchedulerStore, SchedulerConfig, SchedulerStore,
    StoredSchedulerState, SyncPriority,
};
pub use conflict::{
    classify, ConflictDescriptor, ConflictType, ResolutionOutcome, ResolutionStrategy,
    LATEST_WINS_TIE_BREAK,
};
pub use device::{
    BatteryState, BatteryStatus, ConnectivityState, DeviceConditions, DeviceStatus, NetworkType,
    SkipReason, StaticConditions,
};
pub use engine::{
    BatchSyncResult, EntitySyncOutcome, EntitySyncReport, ItemFailure, SyncEngine,
    SyncEngineConfig,
};
pub use events::{SyncEvent, SyncTrigger};
pub use policy::{ManualResolver, MergeFn, PolicyRegistry, DEFAULT_MANUAL_TIMEOUT};
pub use queue::{ItemPriority, PendingItem, SyncQueue};
pub use resolver::ConflictResolver;
pub use retry::SessionBackoff;
pub use scheduler::{AppState, SessionOutcome, SessionSummary, SyncScheduler};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncEngineConfig::default();
        let _scheduler_config = SchedulerConfig::default();
        let _backoff = SessionBackoff::from_config(&SchedulerConfig::default());
        let _resolver = ConflictResolver::new(Arc::new(PolicyRegistry::new()));
        let _queue = SyncQueue::new();
        assert_eq!(classify(true, true), ConflictType::BothModified);
    }
}
