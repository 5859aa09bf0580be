//! Sync lifecycle events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::device::SkipReason;
use crate::engine::ItemFailure;

/// What started a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
    NetworkChange,
    AppForeground,
    Login,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::Manual => "MANUAL",
            SyncTrigger::Scheduled => "SCHEDULED",
            SyncTrigger::NetworkChange => "NETWORK_CHANGE",
            SyncTrigger::AppForeground => "APP_FOREGROUND",
            SyncTrigger::Login => "LOGIN",
        };
        f.write_str(name)
    }
}

/// Event published by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    #[serde(rename = "syncStarted")]
    Started {
        session_id: Uuid,
        trigger: SyncTrigger,
        items: usize,
    },
    #[serde(rename = "syncSkipped")]
    Skipped {
        trigger: SyncTrigger,
        reason: SkipReason,
    },
    #[serde(rename = "syncCompleted")]
    Completed {
        session_id: Uuid,
        trigger: SyncTrigger,
        items: usize,
        synced: usize,
        errors: Vec<ItemFailure>,
        duration: Duration,
    },
    #[serde(rename = "syncError")]
    Error {
        session_id: Uuid,
        trigger: SyncTrigger,
        message: String,
    },
}

impl SyncEvent {
    /// Event name as seen by observers.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Started { .. } => "syncStarted",
            SyncEvent::Skipped { .. } => "syncSkipped",
            SyncEvent::Completed { .. } => "syncCompleted",
            SyncEvent::Error { .. } => "syncError",
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        match self {
            SyncEvent::Started { trigger, .. }
            | SyncEvent::Skipped { trigger, .. }
            | SyncEvent::Completed { trigger, .. }
            | SyncEvent::Error { trigger, .. } => *trigger,
        }
    }
}
