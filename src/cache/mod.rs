//! Entity cache - persisted collection snapshots with staleness tracking
//!
//! Serves the freshest locally available copy of each entity collection:
//! - Durable `{data, timestamp}` envelopes in the store, one per kind
//! - Per-kind freshness windows (the member directory changes slowly,
//!   announcements do not)
//! - Staleness derived on every read, never persisted
//! - moka hot layer in front of SQLite with hit/miss statistics

use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::models::EntityKind;
use crate::store::{Store, StoreError, StoreResult};

// ============================================================================
// Configuration
// ============================================================================

/// How long each entity kind counts as fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessWindows {
    pub members: Duration,
    pub events: Duration,
    pub announcements: Duration,
}

impl FreshnessWindows {
    pub fn window_for(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::Members => self.members,
            EntityKind::Events => self.events,
            EntityKind::Announcements => self.announcements,
        }
    }
}

impl Default for FreshnessWindows {
    fn default() -> Self {
        Self {
            members: Duration::from_secs(24 * 60 * 60), // 24 hours
            events: Duration::from_secs(60 * 60),       // 1 hour
            announcements: Duration::from_secs(15 * 60), // 15 minutes
        }
    }
}

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Freshness window per entity kind.
    pub windows: FreshnessWindows,

    /// Maximum number of collections held in the hot layer.
    pub hot_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            windows: FreshnessWindows::default(),
            hot_capacity: 16,
        }
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// Persisted form of one cached collection.
///
/// Staleness is intentionally absent here; it is a function of the current
/// clock and is derived on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry<T> {
    pub data: T,

    /// Epoch milliseconds at which `data` was fetched.
    pub timestamp: i64,
}

/// One cache read, annotated with staleness at the moment of the read.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub data: T,

    /// Epoch milliseconds at which the data was fetched.
    pub fetched_at_ms: i64,

    /// Whether the entry's age exceeded its kind's freshness window.
    pub is_stale: bool,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
}

// ============================================================================
// Cache store
// ============================================================================

/// Entity cache over the persistent store.
#[derive(Clone)]
pub struct CacheStore {
    store: Store,
    hot: Arc<Cache<EntityKind, CachedEntry<serde_json::Value>>>,
    windows: FreshnessWindows,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl CacheStore {
    /// Create a cache with default configuration.
    pub fn new(store: Store) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    /// Create a cache with custom configuration.
    pub fn with_config(store: Store, config: CacheConfig) -> Self {
        // No moka TTL: expiry would silently drop envelopes that are still
        // valid for stale-tolerant reads. Age is judged against the windows.
        let hot = Cache::builder().max_capacity(config.hot_capacity).build();

        Self {
            store,
            hot: Arc::new(hot),
            windows: config.windows,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Read the cached collection for `kind`.
    ///
    /// Never fails: a storage error or an undecodable payload degrades to a
    /// miss, which pushes the caller onto the network path.
    pub async fn get<T: DeserializeOwned>(&self, kind: EntityKind) -> Option<Cached<T>> {
        let envelope = match self.load_envelope(kind).await {
            Some(envelope) => envelope,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let data = match serde_json::from_value::<T>(envelope.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                log::warn!(
                    "Cached {} payload does not decode, treating as miss: {}",
                    kind.as_str(),
                    e
                );
                self.hot.invalidate(&kind).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        let is_stale = is_stale_at(envelope.timestamp, now_ms(), self.windows.window_for(kind));

        Some(Cached {
            data,
            fetched_at_ms: envelope.timestamp,
            is_stale,
        })
    }

    /// Overwrite the cached collection for `kind` with a snapshot fetched now.
    ///
    /// Write failures propagate; swallowing one would leave an old snapshot
    /// masquerading as the latest fetch.
    pub async fn put<T: Serialize>(&self, kind: EntityKind, data: &T) -> StoreResult<()> {
        let value =
            serde_json::to_value(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let envelope = CachedEntry {
            data: value,
            timestamp: now_ms(),
        };

        // Persist first so the hot layer never gets ahead of disk.
        self.store.set(kind.cache_key(), &envelope)?;
        self.hot.insert(kind, envelope).await;
        Ok(())
    }

    /// Drop the cached collection for `kind`.
    pub async fn invalidate(&self, kind: EntityKind) -> StoreResult<()> {
        self.store.remove(kind.cache_key())?;
        self.hot.invalidate(&kind).await;
        Ok(())
    }

    /// Drop every cached collection. Used on logout and account switch.
    pub async fn clear(&self) -> StoreResult<()> {
        self.store.remove_prefix("cache:")?;
        self.hot.invalidate_all();
        self.hot.run_pending_tasks().await;
        Ok(())
    }

    /// Hit/miss statistics for diagnostics.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            total_requests: total,
            hit_rate,
        }
    }

    /// Reset hit/miss statistics.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Envelope from the hot layer, else from the store. Store read failures
    /// degrade to a miss.
    async fn load_envelope(&self, kind: EntityKind) -> Option<CachedEntry<serde_json::Value>> {
        if let Some(envelope) = self.hot.get(&kind).await {
            return Some(envelope);
        }

        match self
            .store
            .get::<CachedEntry<serde_json::Value>>(kind.cache_key())
        {
            Ok(Some(envelope)) => {
                self.hot.insert(kind, envelope.clone()).await;
                Some(envelope)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!(
                    "Cache read for {} failed, treating as miss: {}",
                    kind.as_str(),
                    e
                );
                None
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// An entry is stale once its age strictly exceeds the window. An entry aged
/// exactly one window is still fresh; one a millisecond older is not.
fn is_stale_at(fetched_at_ms: i64, now_ms: i64, window: Duration) -> bool {
    let age_ms = now_ms - fetched_at_ms;
    age_ms > window.as_millis() as i64
}
