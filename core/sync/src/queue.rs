//! Pending sync queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use fieldsync_common::{EntityKey, Error, Result};

use crate::config::SyncPriority;

/// Priority of a queued entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemPriority {
    High,
    Normal,
    Low,
}

impl ItemPriority {
    /// Whether a session running in `mode` picks this item up.
    pub fn selected_by(self, mode: SyncPriority) -> bool {
        match mode {
            SyncPriority::All => true,
            SyncPriority::HighOnly => self == ItemPriority::High,
            SyncPriority::Normal => self != ItemPriority::Low,
        }
    }
}

/// An entity waiting to be reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingItem {
    pub key: EntityKey,
    pub priority: ItemPriority,
    pub enqueued_at: DateTime<Utc>,
    /// Failed or deferred sessions so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Bumped on every enqueue of this key.
    #[serde(default)]
    pub generation: u64,
}

impl PendingItem {
    pub fn new(key: EntityKey, priority: ItemPriority) -> Self {
        Self {
            key,
            priority,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
            generation: 0,
        }
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }
}

/// Entities waiting for the next sync session, one entry per key.
///
/// Keying by entity guarantees a session never issues the same id twice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncQueue {
    items: HashMap<String, PendingItem>,
    #[serde(default)]
    next_generation: u64,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entity.
    ///
    /// Re-queuing an entity keeps its history, raises its priority if the
    /// new one is higher, and gives it a new generation.
    pub fn enqueue(&mut self, key: EntityKey, priority: ItemPriority) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let item = self
            .items
            .entry(key.to_cache_key())
            .and_modify(|item| item.priority = item.priority.min(priority))
            .or_insert_with(|| PendingItem::new(key, priority));
        item.generation = generation;
    }

    pub fn get(&self, key: &EntityKey) -> Option<&PendingItem> {
        self.items.get(&key.to_cache_key())
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<PendingItem> {
        self.items.remove(&key.to_cache_key())
    }

    /// Remove a synced item unless it was re-queued after `generation`
    /// was read. Returns whether it was removed.
    pub fn complete(&mut self, key: &EntityKey, generation: u64) -> bool {
        let cache_key = key.to_cache_key();
        match self.items.get(&cache_key) {
            Some(item) if item.generation == generation => {
                self.items.remove(&cache_key);
                true
            }
            _ => false,
        }
    }

    /// Record a failed or deferred attempt.
    pub fn mark_failed(&mut self, key: &EntityKey, error: impl Into<String>) {
        if let Some(item) = self.items.get_mut(&key.to_cache_key()) {
            item.mark_failed(error);
        }
    }

    /// Items a session in `mode` should sync, highest priority and oldest first.
    pub fn select(&self, mode: SyncPriority) -> Vec<PendingItem> {
        let mut selected: Vec<PendingItem> = self
            .items
            .values()
            .filter(|item| item.priority.selected_by(mode))
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then(a.key.cmp(&b.key))
        });
        selected
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count_by_priority(&self) -> HashMap<ItemPriority, usize> {
        let mut counts = HashMap::new();
        for item in self.items.values() {
            *counts.entry(item.priority).or_insert(0) += 1;
        }
        counts
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> EntityKey {
        EntityKey::new("stop", id).unwrap()
    }

    #[test]
    fn test_enqueue_deduplicates() {
        let mut queue = SyncQueue::new();
        queue.enqueue(key("1"), ItemPriority::Low);
        queue.mark_failed(&key("1"), "offline");
        queue.enqueue(key("1"), ItemPriority::High);
        queue.enqueue(key("1"), ItemPriority::Normal);

        assert_eq!(queue.len(), 1);
        let item = queue.get(&key("1")).unwrap();
        assert_eq!(item.priority, ItemPriority::High);
        assert_eq!(item.attempts, 1);
    }

    #[test]
    fn test_complete_keeps_requeued_items() {
        let mut queue = SyncQueue::new();
        queue.enqueue(key("1"), ItemPriority::Normal);
        queue.enqueue(key("2"), ItemPriority::Normal);
        let selected = queue.select(SyncPriority::All);

        // Edited again while the session runs
        queue.enqueue(key("1"), ItemPriority::High);

        for item in &selected {
            queue.complete(&item.key, item.generation);
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(&key("1")).unwrap().priority, ItemPriority::High);
        assert!(queue.get(&key("2")).is_none());
    }

    #[test]
    fn test_priority_filters() {
        let mut queue = SyncQueue::new();
        queue.enqueue(key("h"), ItemPriority::High);
        queue.enqueue(key("n"), ItemPriority::Normal);
        queue.enqueue(key("l"), ItemPriority::Low);

        assert_eq!(queue.select(SyncPriority::All).len(), 3);

        let high: Vec<String> = queue
            .select(SyncPriority::HighOnly)
            .into_iter()
            .map(|i| i.key.id().to_string())
            .collect();
        assert_eq!(high, vec!["h"]);

        let normal: Vec<String> = queue
            .select(SyncPriority::Normal)
            .into_iter()
            .map(|i| i.key.id().to_string())
            .collect();
        assert_eq!(normal, vec!["h", "n"]);
    }

    #[test]
    fn test_select_orders_by_priority() {
        let mut queue = SyncQueue::new();
        queue.enqueue(key("a"), ItemPriority::Low);
        queue.enqueue(key("b"), ItemPriority::High);

        let selected = queue.select(SyncPriority::All);
        assert_eq!(selected[0].key.id(), "b");
        assert_eq!(selected[1].key.id(), "a");
    }

    #[test]
    fn test_remove_and_counts() {
        let mut queue = SyncQueue::new();
        queue.enqueue(key("1"), ItemPriority::High);
        queue.enqueue(key("2"), ItemPriority::High);
        queue.enqueue(key("3"), ItemPriority::Low);

        let counts = queue.count_by_priority();
        assert_eq!(*counts.get(&ItemPriority::High).unwrap_or(&0), 2);

        assert!(queue.remove(&key("1")).is_some());
        assert!(queue.remove(&key("1")).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_queue_serialization() {
        let mut queue = SyncQueue::new();
        queue.enqueue(key("1"), ItemPriority::Normal);

        let json = queue.to_json().unwrap();
        let restored = SyncQueue::from_json(&json).unwrap();

        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get(&key("1")).unwrap().priority, ItemPriority::Normal);
    }
}
