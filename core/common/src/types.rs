//! Common types used throughout FieldSync.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity snapshot payload.
///
/// The engine imposes no schema; equality is deep JSON equality.
pub type Snapshot = serde_json::Value;

/// Mutation time in epoch milliseconds.
pub type Timestamp = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Separator between entity type and id in cache keys.
pub const KEY_SEPARATOR: char = ':';

/// Identity of one synchronized entity.
///
/// Rendered as `"{entity_type}:{id}"` when used as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    entity_type: String,
    id: String,
}

impl EntityKey {
    /// Create a new key.
    ///
    /// # Errors
    /// - Entity type is empty or contains the key separator
    /// - Id is empty
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> crate::Result<Self> {
        let entity_type = entity_type.into();
        let id = id.into();
        if entity_type.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity type cannot be empty".to_string(),
            ));
        }
        if entity_type.contains(KEY_SEPARATOR) {
            return Err(crate::Error::InvalidInput(format!(
                "Entity type cannot contain '{}': {}",
                KEY_SEPARATOR, entity_type
            )));
        }
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity id cannot be empty".to_string(),
            ));
        }
        Ok(Self { entity_type, id })
    }

    /// Parse a cache key of the form `"{entity_type}:{id}"`.
    ///
    /// Only the first separator splits; ids may contain further colons.
    pub fn parse(key: &str) -> crate::Result<Self> {
        let (entity_type, id) = key.split_once(KEY_SEPARATOR).ok_or_else(|| {
            crate::Error::InvalidInput(format!("Cache key has no entity type: {}", key))
        })?;
        Self::new(entity_type, id)
    }

    /// Prefix shared by every key of an entity type.
    pub fn prefix_for(entity_type: &str) -> String {
        format!("{}{}", entity_type, KEY_SEPARATOR)
    }

    /// Get the entity type.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Get the entity id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Render as a cache key.
    pub fn to_cache_key(&self) -> String {
        format!("{}{}{}", self.entity_type, KEY_SEPARATOR, self.id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.entity_type, KEY_SEPARATOR, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_creation() {
        let key = EntityKey::new("route", "123").unwrap();
        assert_eq!(key.entity_type(), "route");
        assert_eq!(key.id(), "123");
        assert_eq!(key.to_cache_key(), "route:123");
        assert_eq!(key.to_string(), "route:123");
    }

    #[test]
    fn test_entity_key_empty_fails() {
        assert!(EntityKey::new("", "1").is_err());
        assert!(EntityKey::new("route", "").is_err());
        assert!(EntityKey::new("a:b", "1").is_err());
    }

    #[test]
    fn test_entity_key_parse() {
        let key = EntityKey::parse("reward:abc").unwrap();
        assert_eq!(key.entity_type(), "reward");
        assert_eq!(key.id(), "abc");

        // Ids keep any further separators
        let key = EntityKey::parse("stop:2024:07").unwrap();
        assert_eq!(key.id(), "2024:07");

        assert!(EntityKey::parse("no-separator").is_err());
    }

    #[test]
    fn test_prefix_matches_keys() {
        let key = EntityKey::new("route", "9").unwrap();
        assert!(key.to_cache_key().starts_with(&EntityKey::prefix_for("route")));
        assert!(!key.to_cache_key().starts_with(&EntityKey::prefix_for("rout")));
    }

    #[test]
    fn test_now_millis_is_epoch_millis() {
        // Anything after 2020-01-01
        assert!(now_millis() > 1_577_836_800_000);
    }
}
