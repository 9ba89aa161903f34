//! Offline action queue - durable FIFO of writes awaiting replay
//!
//! Writes attempted while offline (or that failed in transit) land here and
//! are replayed in arrival order on the next sync pass:
//! - Store-backed persistence under a single well-known key
//! - FIFO replay order
//! - Per-action retry counts, persisted across restarts
//! - Corrupt queue data degrades to an empty queue rather than wedging sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{Store, StoreError, StoreResult};

/// Store key holding the serialized queue.
pub const QUEUE_KEY: &str = "offline_queue";

// ============================================================================
// Data Types
// ============================================================================

/// What a queued action does, from the app's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Register,
    Confirm,
    Decline,
    ProfileUpdate,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Confirm => "confirm",
            Self::Decline => "decline",
            Self::ProfileUpdate => "profile_update",
        }
    }
}

/// HTTP method used when the action is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// An action as handed in by the caller. The queue assigns identity and
/// bookkeeping fields on enqueue.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub kind: ActionKind,
    pub endpoint: String,
    pub method: HttpMethod,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// A queued action as persisted and replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Unique id, epoch milliseconds plus a random suffix.
    pub id: String,

    #[serde(rename = "type")]
    pub kind: ActionKind,

    /// API path the action is replayed against.
    pub endpoint: String,

    pub method: HttpMethod,

    /// Request body for the replay.
    pub data: serde_json::Map<String, serde_json::Value>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    /// Failed replay attempts so far.
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Queued action not found: {0}")]
    NotFound(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

// ============================================================================
// Offline Queue
// ============================================================================

/// Durable FIFO queue of pending write actions.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Store,
    /// Serializes read-modify-write cycles on the queue key.
    write_lock: Arc<Mutex<()>>,
}

impl OfflineQueue {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Append an action to the queue and return its assigned id.
    pub async fn enqueue(&self, action: NewAction) -> QueueResult<String> {
        let _guard = self.write_lock.lock().await;

        let mut actions = self.load_actions()?;
        let queued = QueuedAction {
            id: next_action_id(),
            kind: action.kind,
            endpoint: action.endpoint,
            method: action.method,
            data: action.data,
            created_at: Utc::now(),
            retry_count: 0,
        };
        let id = queued.id.clone();

        log::info!(
            "Queueing {} action {} for {}",
            queued.kind.as_str(),
            id,
            queued.endpoint
        );

        actions.push(queued);
        self.save_actions(&actions)?;
        Ok(id)
    }

    /// All queued actions in replay (arrival) order.
    ///
    /// Read failures degrade to an empty queue; the next successful write
    /// re-establishes a readable state.
    pub async fn list(&self) -> Vec<QueuedAction> {
        let _guard = self.write_lock.lock().await;

        match self.load_actions() {
            Ok(actions) => actions,
            Err(e) => {
                log::warn!("Failed to read offline queue, treating as empty: {}", e);
                Vec::new()
            }
        }
    }

    /// Remove an action by id. Removing an id that is no longer queued is a
    /// no-op, so replay completion and manual cancellation cannot race into
    /// an error.
    pub async fn remove(&self, id: &str) -> QueueResult<bool> {
        let _guard = self.write_lock.lock().await;

        let mut actions = self.load_actions()?;
        let before = actions.len();
        actions.retain(|action| action.id != id);

        if actions.len() == before {
            return Ok(false);
        }

        self.save_actions(&actions)?;
        log::info!("Removed action {} from offline queue", id);
        Ok(true)
    }

    /// Drop every queued action.
    pub async fn clear(&self) -> QueueResult<()> {
        let _guard = self.write_lock.lock().await;

        self.store.remove(QUEUE_KEY).map_err(QueueError::Storage)?;
        log::info!("Cleared offline queue");
        Ok(())
    }

    /// Record one failed replay attempt for `id` and return the new count.
    /// The count is persisted immediately so attempts survive restarts.
    pub async fn record_failure(&self, id: &str) -> QueueResult<u32> {
        let _guard = self.write_lock.lock().await;

        let mut actions = self.load_actions()?;
        let action = actions
            .iter_mut()
            .find(|action| action.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        action.retry_count += 1;
        let count = action.retry_count;
        self.save_actions(&actions)?;

        log::warn!("Action {} failed to replay, retry count now {}", id, count);
        Ok(count)
    }

    /// Number of queued actions. Read failures count as zero.
    pub async fn len(&self) -> usize {
        self.list().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Decode the persisted queue. An undecodable payload is logged and
    /// reset to empty; storage failures propagate so enqueue cannot silently
    /// drop a write.
    fn load_actions(&self) -> StoreResult<Vec<QueuedAction>> {
        match self.store.get::<Vec<QueuedAction>>(QUEUE_KEY) {
            Ok(Some(actions)) => Ok(actions),
            Ok(None) => Ok(Vec::new()),
            Err(StoreError::Serialization(e)) => {
                log::error!("Offline queue is undecodable, resetting to empty: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn save_actions(&self, actions: &[QueuedAction]) -> StoreResult<()> {
        self.store.set(QUEUE_KEY, &actions.to_vec())
    }
}

/// Epoch milliseconds plus eight random hex chars, unique enough for a
/// single device's queue while staying sortable by creation time.
fn next_action_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

// ============================================================================
// Tests
// ============================================================================
