//! Sync manager - orchestrates queue replay and cache refresh
//!
//! Coordinates connectivity, the offline queue, the entity cache and the API
//! client. One sync pass:
//! - Bails out immediately (and quietly) while offline
//! - Replays queued actions in FIFO order, surfacing 409s as conflicts
//! - Refreshes every entity collection concurrently, best effort
//! - Records the completion time only when storage stayed healthy
//!
//! `sync_all` never returns an error; every failure mode folds into the
//! returned [`SyncResult`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::{CacheStore, Cached};
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::models::{Announcement, EntityKind, Event, Member};
use crate::net::{ApiClient, ApiError};
use crate::queue::{ActionKind, NewAction, OfflineQueue, QueueError};
use crate::store::{Store, StoreError};

/// Store key holding the completion time of the last sync pass.
pub const LAST_SYNC_KEY: &str = "last_sync";

// ============================================================================
// Result Types
// ============================================================================

/// A queued action the server rejected with 409. Produced for the caller to
/// resolve; never persisted or retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Id of the originating queued action.
    #[serde(rename = "id")]
    pub action_id: String,

    #[serde(rename = "type")]
    pub kind: ActionKind,

    /// What this device tried to submit.
    #[serde(rename = "localData")]
    pub local_data: serde_json::Value,

    /// The server's copy at rejection time.
    #[serde(rename = "serverData")]
    pub server_data: serde_json::Value,
}

/// Aggregate outcome of one sync pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    /// False when the pass did not run (offline, or another pass was already
    /// in flight). True whenever a pass ran, even with per-action failures.
    pub success: bool,

    /// Actions replayed and accepted by the server.
    pub synced: u32,

    /// Actions terminally failed this pass: conflicts plus exhausted retries.
    pub failed: u32,

    pub conflicts: Vec<SyncConflict>,

    /// Human-readable failure notes, one per failed replay or refresh. Keeps
    /// "offline" and "online but the server misbehaved" distinguishable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl SyncResult {
    /// Result for a pass that did not run.
    fn skipped() -> Self {
        Self::default()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Outcome of [`SyncManager::submit`].
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The server accepted the write; the response body is attached.
    Applied(serde_json::Value),

    /// The write could not be delivered now and was queued for replay.
    Queued { action_id: String },
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Device is offline")]
    Offline,

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

// ============================================================================
// Sync Manager
// ============================================================================

/// Orchestrates offline-first reads and writes against the backend.
#[derive(Clone)]
pub struct SyncManager {
    api: Arc<ApiClient>,
    cache: CacheStore,
    queue: OfflineQueue,
    monitor: ConnectivityMonitor,
    store: Store,
    retry_budget: u32,
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag even if a pass unwinds early.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncManager {
    pub fn new(
        api: Arc<ApiClient>,
        cache: CacheStore,
        queue: OfflineQueue,
        monitor: ConnectivityMonitor,
        store: Store,
        retry_budget: u32,
    ) -> Self {
        Self {
            api,
            cache,
            queue,
            monitor,
            store,
            retry_budget,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The offline queue, for inspecting or amending pending actions.
    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// The entity cache, for direct reads and stats.
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// The connectivity monitor, for state reports and subscriptions.
    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    // ========================================================================
    // Sync Pass
    // ========================================================================

    /// Run one sync pass: drain the queue, then refresh all caches.
    ///
    /// Never fails; the result carries all per-action and per-collection
    /// outcomes. At most one pass runs at a time; a trigger landing while a
    /// pass is in flight is dropped with an inert result, so a reconnect
    /// event and a pull-to-refresh cannot double-submit the same action.
    pub async fn sync_all(&self) -> SyncResult {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Sync already in flight, dropping duplicate trigger");
            return SyncResult::skipped();
        }
        let _guard = InFlightGuard(self.in_flight.clone());

        if !self.monitor.is_online() {
            log::info!("Offline, skipping sync pass");
            return SyncResult::skipped();
        }

        log::info!("Starting sync pass");
        let mut result = SyncResult {
            success: true,
            ..Default::default()
        };
        let mut storage_clean = true;

        // Drain before refresh so the server sees pending intents before we
        // re-read its state; a just-replayed registration must show up in
        // the freshly fetched event list.
        self.drain_queue(&mut result, &mut storage_clean).await;

        let (members, events, announcements) = tokio::join!(
            self.refresh_collection::<Member>(EntityKind::Members),
            self.refresh_collection::<Event>(EntityKind::Events),
            self.refresh_collection::<Announcement>(EntityKind::Announcements),
        );
        for (kind, outcome) in [
            (EntityKind::Members, members),
            (EntityKind::Events, events),
            (EntityKind::Announcements, announcements),
        ] {
            if let Err(e) = outcome {
                if matches!(e, SyncError::Storage(_)) {
                    storage_clean = false;
                }
                log::warn!("Cache refresh for {} failed: {}", kind.as_str(), e);
                result.errors.push(format!("refresh {}: {}", kind.as_str(), e));
            }
        }

        if storage_clean {
            self.record_sync_time(&mut result);
        } else {
            log::warn!("Storage errors during sync pass, not recording sync time");
        }

        log::info!(
            "Sync pass complete: {} synced, {} failed, {} conflicts",
            result.synced,
            result.failed,
            result.conflicts.len()
        );
        result
    }

    /// Replay every queued action in FIFO order.
    async fn drain_queue(&self, result: &mut SyncResult, storage_clean: &mut bool) {
        let actions = self.queue.list().await;
        if actions.is_empty() {
            log::info!("Offline queue is empty, nothing to replay");
            return;
        }

        log::info!("Replaying {} queued actions", actions.len());

        for action in actions {
            match self
                .api
                .execute(action.method.into(), &action.endpoint, Some(&action.data))
                .await
            {
                Ok(_) => {
                    log::info!(
                        "Replayed {} action {} against {}",
                        action.kind.as_str(),
                        action.id,
                        action.endpoint
                    );
                    result.synced += 1;
                    self.dequeue(&action.id, result, storage_clean).await;
                }
                Err(ApiError::Conflict { body }) => {
                    // Terminal: the server's state diverged. Surface both
                    // sides and drop the action.
                    log::warn!(
                        "Action {} rejected as conflict by {}",
                        action.id,
                        action.endpoint
                    );
                    result.conflicts.push(SyncConflict {
                        action_id: action.id.clone(),
                        kind: action.kind,
                        local_data: serde_json::Value::Object(action.data.clone()),
                        server_data: body,
                    });
                    result.failed += 1;
                    self.dequeue(&action.id, result, storage_clean).await;
                }
                Err(e) => {
                    log::warn!("Action {} failed to replay: {}", action.id, e);
                    result
                        .errors
                        .push(format!("replay {}: {}", action.id, e));

                    match self.queue.record_failure(&action.id).await {
                        Ok(count) if count >= self.retry_budget => {
                            log::warn!(
                                "Action {} exhausted its retry budget ({} attempts), dropping",
                                action.id,
                                count
                            );
                            result.failed += 1;
                            self.dequeue(&action.id, result, storage_clean).await;
                        }
                        Ok(count) => {
                            log::info!(
                                "Action {} stays queued (attempt {}/{})",
                                action.id,
                                count,
                                self.retry_budget
                            );
                        }
                        Err(e) => {
                            log::error!(
                                "Failed to record replay failure for {}: {}",
                                action.id,
                                e
                            );
                            result.errors.push(format!("bookkeeping {}: {}", action.id, e));
                            *storage_clean = false;
                        }
                    }
                }
            }
        }
    }

    /// Remove a finished action, downgrading removal failures to bookkeeping.
    /// A lost removal means the action replays next pass (at-least-once).
    async fn dequeue(&self, id: &str, result: &mut SyncResult, storage_clean: &mut bool) {
        if let Err(e) = self.queue.remove(id).await {
            log::error!("Failed to remove action {} from queue: {}", id, e);
            result.errors.push(format!("dequeue {}: {}", id, e));
            *storage_clean = false;
        }
    }

    /// Fetch one collection and overwrite its cache entry.
    async fn refresh_collection<T>(&self, kind: EntityKind) -> Result<(), SyncError>
    where
        T: DeserializeOwned + Serialize,
    {
        let data: Vec<T> = self.api.get(kind.endpoint()).await?;
        self.cache.put(kind, &data).await?;
        log::info!("Refreshed {} cache ({} records)", kind.as_str(), data.len());
        Ok(())
    }

    fn record_sync_time(&self, result: &mut SyncResult) {
        let now = Utc::now().to_rfc3339();
        if let Err(e) = self.store.set(LAST_SYNC_KEY, &now) {
            log::error!("Failed to record sync time: {}", e);
            result.errors.push(format!("record sync time: {}", e));
        }
    }

    /// Completion time of the last recorded sync pass.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        match self.store.get::<String>(LAST_SYNC_KEY) {
            Ok(Some(ts)) => DateTime::parse_from_rfc3339(&ts)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Ok(None) => None,
            Err(e) => {
                log::warn!("Failed to read last sync time: {}", e);
                None
            }
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The member directory, freshest copy available.
    pub async fn members(&self) -> Result<Cached<Vec<Member>>, SyncError> {
        self.read_through(EntityKind::Members).await
    }

    /// Upcoming events, freshest copy available.
    pub async fn events(&self) -> Result<Cached<Vec<Event>>, SyncError> {
        self.read_through(EntityKind::Events).await
    }

    /// Announcements, freshest copy available.
    pub async fn announcements(&self) -> Result<Cached<Vec<Announcement>>, SyncError> {
        self.read_through(EntityKind::Announcements).await
    }

    /// Cache-first read: a fresh entry short-circuits, a stale entry is
    /// refreshed when possible and served as-is when not, a miss goes to the
    /// network or reports offline.
    async fn read_through<T>(&self, kind: EntityKind) -> Result<Cached<Vec<T>>, SyncError>
    where
        T: DeserializeOwned + Serialize,
    {
        match self.cache.get::<Vec<T>>(kind).await {
            Some(entry) if !entry.is_stale => Ok(entry),
            Some(stale) => {
                if !self.monitor.is_online() {
                    log::info!("Offline, serving stale {} cache", kind.as_str());
                    return Ok(stale);
                }
                match self.fetch_and_cache::<T>(kind).await {
                    Ok(fresh) => Ok(fresh),
                    Err(e) => {
                        log::warn!(
                            "Refresh for {} failed, serving stale cache: {}",
                            kind.as_str(),
                            e
                        );
                        Ok(stale)
                    }
                }
            }
            None => {
                if !self.monitor.is_online() {
                    return Err(SyncError::Offline);
                }
                self.fetch_and_cache::<T>(kind).await
            }
        }
    }

    async fn fetch_and_cache<T>(&self, kind: EntityKind) -> Result<Cached<Vec<T>>, SyncError>
    where
        T: DeserializeOwned + Serialize,
    {
        let data: Vec<T> = self.api.get(kind.endpoint()).await?;
        self.cache.put(kind, &data).await?;

        Ok(Cached {
            data,
            fetched_at_ms: Utc::now().timestamp_millis(),
            is_stale: false,
        })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Submit a write: straight to the server when online, into the queue
    /// when offline or when the failure looks transient. Deterministic
    /// rejections (validation errors, conflicts) surface immediately rather
    /// than being queued to fail again.
    pub async fn submit(&self, action: NewAction) -> Result<SubmitOutcome, SyncError> {
        if !self.monitor.is_online() {
            let action_id = self.queue.enqueue(action).await?;
            return Ok(SubmitOutcome::Queued { action_id });
        }

        match self
            .api
            .execute(action.method.into(), &action.endpoint, Some(&action.data))
            .await
        {
            Ok(value) => Ok(SubmitOutcome::Applied(value)),
            Err(e) if e.is_retryable() => {
                log::warn!(
                    "Direct {} to {} failed ({}), queueing for replay",
                    action.kind.as_str(),
                    action.endpoint,
                    e
                );
                let action_id = self.queue.enqueue(action).await?;
                Ok(SubmitOutcome::Queued { action_id })
            }
            Err(e) => Err(SyncError::Api(e)),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// React to connectivity being restored by running a sync pass. The
    /// subscription must be kept alive for as long as the reaction should
    /// stay armed. A transition reported from a thread with no tokio runtime
    /// is logged and skipped; the queue keeps the work for the next trigger.
    pub fn watch_connectivity(&self) -> Subscription {
        let manager = self.clone();
        self.monitor.on_change(move |online| {
            if !online {
                return;
            }
            let handle = match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    log::warn!(
                        "Connectivity restored outside a tokio runtime, not scheduling sync pass"
                    );
                    return;
                }
            };
            log::info!("Connectivity restored, scheduling sync pass");
            let manager = manager.clone();
            handle.spawn(async move {
                let result = manager.sync_all().await;
                log::info!(
                    "Reconnect sync finished: {} synced, {} failed, {} conflicts",
                    result.synced,
                    result.failed,
                    result.conflicts.len()
                );
            });
        })
    }

    /// Drop caches, queued actions, the sync marker and the auth token.
    /// Used on logout and account switch.
    pub async fn reset_local_state(&self) -> Result<(), SyncError> {
        self.cache.clear().await?;
        self.queue.clear().await?;
        self.store.remove(LAST_SYNC_KEY)?;
        self.api.clear_auth_token().await;
        log::info!("Cleared local sync state");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
