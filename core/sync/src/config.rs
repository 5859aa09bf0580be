//! Scheduler configuration and its persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use fieldsync_common::{Error, Result};

/// Longest accepted `syncInterval`: one year, in minutes.
pub const MAX_SYNC_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

/// Longest accepted `retryDelay`: one day, in seconds.
pub const MAX_RETRY_DELAY_SECS: u64 = 24 * 60 * 60;

/// Which queued items a session picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPriority {
    /// Every pending item.
    All,
    /// Only high-priority items.
    HighOnly,
    /// High- and normal-priority items.
    Normal,
}

/// Background sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub is_enabled: bool,
    /// Minutes between scheduled syncs; 0 disables the timer.
    pub sync_interval: u64,
    pub sync_on_foreground: bool,
    pub sync_on_network_change: bool,
    pub require_wifi: bool,
    pub require_charging: bool,
    /// Battery floor in percent.
    pub sync_when_battery_above: u8,
    pub data_saver_mode: bool,
    pub sync_priority: SyncPriority,
    pub max_concurrent_sync: usize,
    /// Session retries after the first attempt.
    pub retry_attempts: u32,
    /// Seconds before the first session retry.
    pub retry_delay: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            sync_interval: 15,
            sync_on_foreground: true,
            sync_on_network_change: true,
            require_wifi: false,
            require_charging: false,
            sync_when_battery_above: 20,
            data_saver_mode: false,
            sync_priority: SyncPriority::All,
            max_concurrent_sync: 3,
            retry_attempts: 3,
            retry_delay: 60,
        }
    }
}

impl SchedulerConfig {
    /// Check value ranges.
    ///
    /// # Errors
    /// - `max_concurrent_sync` is zero
    /// - `sync_when_battery_above` exceeds 100
    /// - `sync_interval` exceeds [`MAX_SYNC_INTERVAL_MINUTES`]
    /// - `retry_delay` exceeds [`MAX_RETRY_DELAY_SECS`]
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sync == 0 {
            return Err(Error::Config(
                "maxConcurrentSync must be at least 1".to_string(),
            ));
        }
        if self.sync_when_battery_above > 100 {
            return Err(Error::Config(format!(
                "syncWhenBatteryAbove must be a percentage, got {}",
                self.sync_when_battery_above
            )));
        }
        if self.sync_interval > MAX_SYNC_INTERVAL_MINUTES {
            return Err(Error::Config(format!(
                "syncInterval must be at most {} minutes, got {}",
                MAX_SYNC_INTERVAL_MINUTES, self.sync_interval
            )));
        }
        if self.retry_delay > MAX_RETRY_DELAY_SECS {
            return Err(Error::Config(format!(
                "retryDelay must be at most {} seconds, got {}",
                MAX_RETRY_DELAY_SECS, self.retry_delay
            )));
        }
        Ok(())
    }

    /// Scheduled sync period, `None` when the timer is off.
    ///
    /// Unvalidated values are clamped to [`MAX_SYNC_INTERVAL_MINUTES`].
    pub fn interval(&self) -> Option<Duration> {
        let minutes = self.sync_interval.min(MAX_SYNC_INTERVAL_MINUTES);
        (minutes > 0).then(|| Duration::from_secs(minutes * 60))
    }

    /// Delay before the first session retry, clamped like [`Self::interval`].
    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_secs(self.retry_delay.min(MAX_RETRY_DELAY_SECS))
    }

    /// Return a copy with one field replaced.
    ///
    /// `field` is the camelCase name; `value` is parsed as JSON, falling
    /// back to a plain string (so `syncPriority=high-only` works).
    pub fn with_override(&self, field: &str, value: &str) -> Result<Self> {
        let mut raw = serde_json::to_value(self)?;
        let object = raw
            .as_object_mut()
            .ok_or_else(|| Error::Config("configuration is not an object".to_string()))?;
        if !object.contains_key(field) {
            return Err(Error::Config(format!("Unknown configuration field: {}", field)));
        }
        let parsed = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        object.insert(field.to_string(), parsed);

        let updated: Self = serde_json::from_value(raw)
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", field, e)))?;
        updated.validate()?;
        Ok(updated)
    }
}

/// Host-side persistence for scheduler state that outlives the process.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn load_config(&self) -> Result<Option<SchedulerConfig>>;

    async fn save_config(&self, config: &SchedulerConfig) -> Result<()>;

    async fn load_last_sync(&self) -> Result<Option<DateTime<Utc>>>;

    async fn save_last_sync(&self, at: DateTime<Utc>) -> Result<()>;
}

/// Load the stored configuration, or the defaults if none was saved.
pub async fn load_config_or_default(store: &dyn SchedulerStore) -> Result<SchedulerConfig> {
    let config = store.load_config().await?.unwrap_or_default();
    config.validate()?;
    Ok(config)
}

/// Everything a store persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSchedulerState {
    pub config: Option<SchedulerConfig>,
    pub last_successful_sync: Option<DateTime<Utc>>,
}

/// In-memory scheduler store.
#[derive(Default)]
pub struct MemorySchedulerStore {
    state: RwLock<StoredSchedulerState>,
}

impl MemorySchedulerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds state.
    pub fn with_state(state: StoredSchedulerState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> StoredSchedulerState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SchedulerStore for MemorySchedulerStore {
    async fn load_config(&self) -> Result<Option<SchedulerConfig>> {
        Ok(self.read().config)
    }

    async fn save_config(&self, config: &SchedulerConfig) -> Result<()> {
        self.state.write().unwrap_or_else(|e| e.into_inner()).config = Some(config.clone());
        Ok(())
    }

    async fn load_last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read().last_successful_sync)
    }

    async fn save_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .last_successful_sync = Some(at);
        Ok(())
    }
}

/// Scheduler store backed by one JSON file.
///
/// Writes go to a sibling temp file that is renamed over the original.
pub struct JsonFileSchedulerStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSchedulerStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_state(&self) -> Result<StoredSchedulerState> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Config(format!("Corrupt scheduler state {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(StoredSchedulerState::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut StoredSchedulerState) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read_state().await?;
        apply(&mut state);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&state)?).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!("Persisted scheduler state to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for JsonFileSchedulerStore {
    async fn load_config(&self) -> Result<Option<SchedulerConfig>> {
        Ok(self.read_state().await?.config)
    }

    async fn save_config(&self, config: &SchedulerConfig) -> Result<()> {
        config.validate()?;
        let config = config.clone();
        self.update(move |state| state.config = Some(config)).await
    }

    async fn load_last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read_state().await?.last_successful_sync)
    }

    async fn save_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.update(move |state| state.last_successful_sync = Some(at))
            .await
    }
}
