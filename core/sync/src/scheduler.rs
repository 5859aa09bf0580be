//! Sync scheduling - timer, event triggers and device gating.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fieldsync_common::{EntityKey, Error, Result};

use crate::config::{load_config_or_default, SchedulerConfig, SchedulerStore};
use crate::device::{evaluate_gate, DeviceConditions, SkipReason};
use crate::engine::{BatchSyncResult, ItemFailure, SyncEngine};
use crate::events::{SyncEvent, SyncTrigger};
use crate::queue::{ItemPriority, PendingItem, SyncQueue};
use crate::retry::SessionBackoff;

/// Quiet period after a reconnect before a sync starts.
pub const NETWORK_DEBOUNCE: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 64;

/// Application lifecycle state reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
}

/// Summary of a session that ran to completion.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub trigger: SyncTrigger,
    /// Items selected from the queue.
    pub items: usize,
    pub synced: usize,
    pub errors: Vec<ItemFailure>,
    pub duration: Duration,
}

/// What a trigger led to.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// Not attempted.
    Skipped(SkipReason),
    /// Another session was in progress; the trigger was dropped.
    AlreadyRunning,
    Completed(SessionSummary),
    /// Every retry failed.
    Failed(String),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed(_))
    }
}

/// One attempt of a session: reconciled, or stopped by the gate before
/// a retry.
enum SessionAttempt {
    Ran(BatchSyncResult),
    Gated(SkipReason),
}

/// Wall clock that advances with the tokio clock.
///
/// Anchoring to `tokio::time::Instant` keeps due-time arithmetic and the
/// timer on the same clock, including under paused test time.
struct SchedulerClock {
    wall_origin: DateTime<Utc>,
    origin: Instant,
}

impl SchedulerClock {
    fn new() -> Self {
        Self {
            wall_origin: Utc::now(),
            origin: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }
}

/// Clears the in-progress flag when the session ends, however it ends.
struct InProgressGuard<'a>(&'a AtomicBool);

impl<'a> InProgressGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct SchedulerInner {
    engine: Arc<SyncEngine>,
    device: Arc<dyn DeviceConditions>,
    store: Arc<dyn SchedulerStore>,
    queue: RwLock<SyncQueue>,
    config: RwLock<SchedulerConfig>,
    last_success: RwLock<Option<DateTime<Utc>>>,
    in_progress: AtomicBool,
    started: AtomicBool,
    foreground: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    timer: Mutex<Option<JoinHandle<()>>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    clock: SchedulerClock,
}

impl SchedulerInner {
    /// Time left until the next scheduled sync, zero if overdue.
    async fn time_until_due(&self, interval: Duration) -> Duration {
        let Some(last) = *self.last_success.read().await else {
            return Duration::ZERO;
        };
        let interval = chrono::Duration::from_std(interval)
            .unwrap_or_else(|_| chrono::Duration::zero());
        (last + interval - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn replace_task(slot: &Mutex<Option<JoinHandle<()>>>, task: Option<JoinHandle<()>>) {
        let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = task;
    }

    /// Check device conditions against the gates in `config`.
    async fn check_gate(&self, config: &SchedulerConfig) -> std::result::Result<(), SkipReason> {
        match self.device.status().await {
            Ok(status) => evaluate_gate(config, &status),
            Err(e) => {
                warn!("Failed to query device conditions: {}", e);
                Err(SkipReason::ConditionsUnavailable)
            }
        }
    }

    /// Reconcile `items` and update the queue with the results.
    ///
    /// Synced items leave the queue unless they were re-queued while the
    /// session ran. A session in which every item was deferred counts as
    /// a transport failure so that the session is retried.
    async fn run_session(&self, items: &[PendingItem], limit: usize) -> Result<BatchSyncResult> {
        if items.is_empty() {
            return Ok(BatchSyncResult::default());
        }

        let generations: HashMap<&EntityKey, u64> =
            items.iter().map(|item| (&item.key, item.generation)).collect();
        let keys = items.iter().map(|item| item.key.clone()).collect();
        let batch = self.engine.sync_entities_with_limit(keys, limit).await;

        {
            let mut queue = self.queue.write().await;
            for report in batch.reports.iter().filter(|r| !r.is_deferred()) {
                if let Some(generation) = generations.get(&report.key) {
                    if !queue.complete(&report.key, *generation) {
                        debug!("{} changed during the session, keeping it queued", report.key);
                    }
                }
            }
            for failure in &batch.failures {
                queue.mark_failed(&failure.key, failure.message.clone());
            }
        }

        if batch.synced() == 0 && batch.failed() == 0 && batch.deferred() > 0 {
            return Err(Error::Network(format!(
                "All {} items deferred",
                batch.deferred()
            )));
        }
        Ok(batch)
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        Self::replace_task(&self.timer, None);
        Self::replace_task(&self.debounce, None);
    }
}

/// Decides when the sync engine runs.
///
/// Sessions are single-flight: a trigger that arrives while a session is
/// running is dropped, not queued. Cloning yields another handle to the
/// same scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl SyncScheduler {
    /// Create a scheduler with an explicit configuration.
    pub fn new(
        engine: Arc<SyncEngine>,
        device: Arc<dyn DeviceConditions>,
        store: Arc<dyn SchedulerStore>,
        config: SchedulerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                device,
                store,
                queue: RwLock::new(SyncQueue::new()),
                config: RwLock::new(config),
                last_success: RwLock::new(None),
                in_progress: AtomicBool::new(false),
                started: AtomicBool::new(false),
                foreground: AtomicBool::new(true),
                events,
                timer: Mutex::new(None),
                debounce: Mutex::new(None),
                clock: SchedulerClock::new(),
            }),
        }
    }

    /// Create a scheduler from the configuration and last sync time in `store`.
    pub async fn load(
        engine: Arc<SyncEngine>,
        device: Arc<dyn DeviceConditions>,
        store: Arc<dyn SchedulerStore>,
    ) -> Result<Self> {
        let config = load_config_or_default(store.as_ref()).await?;
        let last_sync = store.load_last_sync().await?;
        let scheduler = Self::new(engine, device, store, config);
        *scheduler.inner.last_success.write().await = last_sync;
        Ok(scheduler)
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.inner.engine
    }

    /// Subscribe to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Queue an entity for the next session.
    pub async fn enqueue(&self, key: EntityKey, priority: ItemPriority) {
        self.inner.queue.write().await.enqueue(key, priority);
    }

    /// Copy of the pending queue.
    pub async fn queue(&self) -> SyncQueue {
        self.inner.queue.read().await.clone()
    }

    /// Replace the pending queue, e.g. with one restored from disk.
    pub async fn restore_queue(&self, queue: SyncQueue) {
        *self.inner.queue.write().await = queue;
    }

    pub async fn config(&self) -> SchedulerConfig {
        self.inner.config.read().await.clone()
    }

    /// Validate, persist and apply a new configuration.
    ///
    /// The timer is re-armed so a new interval takes effect immediately.
    pub async fn update_config(&self, config: SchedulerConfig) -> Result<()> {
        config.validate()?;
        self.inner.store.save_config(&config).await?;
        *self.inner.config.write().await = config;
        info!("Scheduler configuration updated");
        self.arm_timer().await;
        Ok(())
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    pub async fn last_successful_sync(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_success.read().await
    }

    /// When the timer will next fire, `None` if scheduled sync is off.
    pub async fn next_scheduled_sync(&self) -> Option<DateTime<Utc>> {
        let config = self.config().await;
        if !config.is_enabled {
            return None;
        }
        let interval = chrono::Duration::from_std(config.interval()?).ok()?;
        let next = match self.last_successful_sync().await {
            Some(last) => last + interval,
            None => self.inner.clock.now(),
        };
        Some(next.max(self.inner.clock.now()))
    }

    /// Start the periodic timer.
    ///
    /// The last successful sync time is reloaded from the store, so the
    /// first scheduled sync happens one interval after it.
    pub async fn start(&self) -> Result<()> {
        let persisted = self.inner.store.load_last_sync().await?;
        if persisted.is_some() {
            *self.inner.last_success.write().await = persisted;
        }
        self.inner.started.store(true, Ordering::Release);
        info!("Sync scheduler started");
        self.arm_timer().await;
        Ok(())
    }

    /// Stop the timer and any pending network trigger.
    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::Release);
        SchedulerInner::replace_task(&self.inner.timer, None);
        SchedulerInner::replace_task(&self.inner.debounce, None);
        info!("Sync scheduler stopped");
    }

    /// React to the app moving between foreground and background.
    ///
    /// Backgrounding cancels the timer. Returning to the foreground re-arms
    /// it from the persisted last sync time and, if enabled, runs an
    /// `APP_FOREGROUND` session.
    pub async fn on_app_state_change(&self, state: AppState) -> Option<SessionOutcome> {
        match state {
            AppState::Background => {
                self.inner.foreground.store(false, Ordering::Release);
                SchedulerInner::replace_task(&self.inner.timer, None);
                debug!("App backgrounded, sync timer cancelled");
                None
            }
            AppState::Foreground => {
                self.inner.foreground.store(true, Ordering::Release);
                match self.inner.store.load_last_sync().await {
                    Ok(Some(at)) => *self.inner.last_success.write().await = Some(at),
                    Ok(None) => {}
                    Err(e) => warn!("Failed to load last sync time: {}", e),
                }
                self.arm_timer().await;

                if self.config().await.sync_on_foreground {
                    Some(self.trigger(SyncTrigger::AppForeground).await)
                } else {
                    None
                }
            }
        }
    }

    /// React to a connectivity change.
    ///
    /// A reconnect schedules a `NETWORK_CHANGE` session after
    /// [`NETWORK_DEBOUNCE`]; further changes inside that window restart it.
    pub fn on_connectivity_change(&self, connected: bool) {
        if !connected {
            SchedulerInner::replace_task(&self.inner.debounce, None);
            debug!("Connectivity lost");
            return;
        }

        let scheduler = self.clone();
        let task = tokio::spawn(async move {
            sleep(NETWORK_DEBOUNCE).await;
            // Detached: a later reconnect only cancels the wait
            drop(scheduler.spawn_session(SyncTrigger::NetworkChange));
        });
        SchedulerInner::replace_task(&self.inner.debounce, Some(task));
    }

    /// Run a session in its own task.
    ///
    /// Aborting the caller (the timer or the debounce) never cuts a session
    /// short; a running session always ends with a terminal event.
    fn spawn_session(&self, trigger: SyncTrigger) -> JoinHandle<SessionOutcome> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.trigger(trigger).await })
    }

    /// Run a session for a signed-in user.
    pub async fn on_login(&self) -> SessionOutcome {
        self.trigger(SyncTrigger::Login).await
    }

    /// Run one sync session now, subject to the configuration and gates.
    pub async fn trigger(&self, trigger: SyncTrigger) -> SessionOutcome {
        let config = self.config().await;
        if let Some(reason) = trigger_disabled(&config, trigger) {
            return self.skip(trigger, reason);
        }

        let Some(_guard) = InProgressGuard::acquire(&self.inner.in_progress) else {
            debug!("Sync already in progress, ignoring {} trigger", trigger);
            return SessionOutcome::AlreadyRunning;
        };

        if let Err(reason) = self.inner.check_gate(&config).await {
            return self.skip(trigger, reason);
        }

        let selected = self.inner.queue.read().await.select(config.sync_priority);
        let items = selected.len();

        let session_id = Uuid::new_v4();
        info!(
            "Sync session {} started by {} with {} items",
            session_id, trigger, items
        );
        self.emit(SyncEvent::Started {
            session_id,
            trigger,
            items,
        });

        let start = Instant::now();
        let limit = config.max_concurrent_sync;
        let attempts = AtomicU32::new(0);
        let (inner, selected, gates, attempts) = (&self.inner, &selected, &config, &attempts);
        let result = SessionBackoff::from_config(&config)
            .run(move || async move {
                // Conditions may have changed while waiting to retry
                if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                    if let Err(reason) = inner.check_gate(gates).await {
                        return Ok(SessionAttempt::Gated(reason));
                    }
                }
                inner.run_session(selected, limit).await.map(SessionAttempt::Ran)
            })
            .await;

        match result {
            Ok(SessionAttempt::Gated(reason)) => {
                info!("Sync session {} stopped before retrying", session_id);
                self.skip(trigger, reason)
            }
            Ok(SessionAttempt::Ran(batch)) => {
                let now = self.inner.clock.now();
                *self.inner.last_success.write().await = Some(now);
                if let Err(e) = self.inner.store.save_last_sync(now).await {
                    warn!("Failed to persist last sync time: {}", e);
                }

                let summary = SessionSummary {
                    session_id,
                    trigger,
                    items,
                    synced: batch.synced(),
                    errors: batch.failures,
                    duration: start.elapsed(),
                };
                info!(
                    "Sync session {} completed: {}/{} synced, {} errors in {:?}",
                    session_id,
                    summary.synced,
                    items,
                    summary.errors.len(),
                    summary.duration
                );
                self.emit(SyncEvent::Completed {
                    session_id,
                    trigger,
                    items,
                    synced: summary.synced,
                    errors: summary.errors.clone(),
                    duration: summary.duration,
                });
                SessionOutcome::Completed(summary)
            }
            Err(e) => {
                error!("Sync session {} failed: {}", session_id, e);
                self.emit(SyncEvent::Error {
                    session_id,
                    trigger,
                    message: e.to_string(),
                });
                SessionOutcome::Failed(e.to_string())
            }
        }
    }

    fn skip(&self, trigger: SyncTrigger, reason: SkipReason) -> SessionOutcome {
        info!("Sync skipped ({}): {}", trigger, reason);
        self.emit(SyncEvent::Skipped {
            trigger,
            reason: reason.clone(),
        });
        SessionOutcome::Skipped(reason)
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is not an error
        let _ = self.inner.events.send(event);
    }

    /// (Re)start the timer if the scheduler is started, foregrounded and
    /// has an interval; otherwise make sure it is stopped.
    async fn arm_timer(&self) {
        let config = self.config().await;
        let active = self.inner.started.load(Ordering::Acquire)
            && self.inner.foreground.load(Ordering::Acquire)
            && config.is_enabled;

        let task = match config.interval() {
            Some(interval) if active => {
                debug!("Arming sync timer ({:?} interval)", interval);
                Some(tokio::spawn(run_timer(
                    Arc::downgrade(&self.inner),
                    interval,
                )))
            }
            _ => None,
        };
        SchedulerInner::replace_task(&self.inner.timer, task);
    }
}

/// Timer loop. Sleeps until the last successful sync plus `interval`,
/// then runs a `SCHEDULED` session.
///
/// After an attempt that did not complete, the next one waits a full
/// interval instead of firing again immediately.
async fn run_timer(weak: Weak<SchedulerInner>, interval: Duration) {
    let mut backoff = false;
    loop {
        let delay = match weak.upgrade() {
            Some(inner) => inner.time_until_due(interval).await,
            None => return,
        };
        let delay = if backoff && delay.is_zero() {
            interval
        } else {
            delay
        };
        sleep(delay).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        // A session from another trigger may have moved the due time
        if !backoff && !inner.time_until_due(interval).await.is_zero() {
            continue;
        }

        let session = SyncScheduler { inner }.spawn_session(SyncTrigger::Scheduled);
        // Aborting the timer here leaves the session running
        backoff = !matches!(session.await, Ok(outcome) if outcome.is_completed());
    }
}

fn trigger_disabled(config: &SchedulerConfig, trigger: SyncTrigger) -> Option<SkipReason> {
    if !config.is_enabled && trigger != SyncTrigger::Manual {
        return Some(SkipReason::Disabled);
    }
    let enabled = match trigger {
        SyncTrigger::Manual | SyncTrigger::Login => true,
        SyncTrigger::Scheduled => config.interval().is_some(),
        SyncTrigger::NetworkChange => config.sync_on_network_change,
        SyncTrigger::AppForeground => config.sync_on_foreground,
    };
    (!enabled).then_some(SkipReason::TriggerDisabled)
}
