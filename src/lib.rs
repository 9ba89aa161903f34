//! # Koinonia Sync
//!
//! Offline-first sync core for the Koinonia congregation app. Keeps the
//! member directory, event calendar and announcement feed usable without a
//! connection, queues writes made while offline and replays them in order
//! once the backend is reachable again.
//!
//! [`OfflineCore`] is the composition root: it wires the SQLite store, HTTP
//! client, entity cache, offline queue and connectivity monitor into a
//! [`SyncManager`] ready for the embedding application.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod models;
pub mod net;
pub mod queue;
pub mod store;
pub mod sync;

pub use cache::{CacheConfig, CacheStats, CacheStore, Cached, FreshnessWindows};
pub use config::CoreConfig;
pub use connectivity::{ConnectivityMonitor, HttpProbe, NetworkProbe, Subscription};
pub use models::{Announcement, EntityKind, Event, Member};
pub use net::{ApiClient, ApiError};
pub use queue::{ActionKind, HttpMethod, NewAction, OfflineQueue, QueuedAction};
pub use store::Store;
pub use sync::{SubmitOutcome, SyncConflict, SyncError, SyncManager, SyncResult};

use std::sync::Arc;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while assembling the core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] store::StoreError),

    #[error("API error: {0}")]
    Api(#[from] net::ApiError),

    #[error("Connectivity error: {0}")]
    Connectivity(#[from] connectivity::MonitorError),
}

// ============================================================================
// Composition Root
// ============================================================================

/// A fully wired sync core: one store and one API client shared by the
/// cache, the offline queue, the connectivity monitor and the sync manager.
pub struct OfflineCore {
    store: Store,
    api: Arc<ApiClient>,
    cache: CacheStore,
    queue: OfflineQueue,
    monitor: ConnectivityMonitor,
    manager: SyncManager,
}

impl OfflineCore {
    /// Assemble the core, probing reachability against the API base URL.
    pub fn open(config: &CoreConfig) -> Result<Self, CoreError> {
        let probe = HttpProbe::new(&config.base_url, config.probe_timeout)?;
        Self::open_with_probe(config, Arc::new(probe))
    }

    /// Assemble the core with a caller-supplied reachability probe. Embedders
    /// with a platform connectivity API plug it in here instead of relying on
    /// HTTP probing.
    pub fn open_with_probe(
        config: &CoreConfig,
        probe: Arc<dyn NetworkProbe>,
    ) -> Result<Self, CoreError> {
        let store = Store::open(&config.resolve_store_path())?;
        log::info!("Opened sync store at {:?}", config.resolve_store_path());
        Self::assemble(config, store, ConnectivityMonitor::with_probe(probe))
    }

    /// In-memory variant for tests and ephemeral sessions. Nothing survives
    /// the process.
    pub fn open_in_memory(config: &CoreConfig) -> Result<Self, CoreError> {
        let store = Store::in_memory()?;
        Self::assemble(config, store, ConnectivityMonitor::new())
    }

    fn assemble(
        config: &CoreConfig,
        store: Store,
        monitor: ConnectivityMonitor,
    ) -> Result<Self, CoreError> {
        let api = Arc::new(ApiClient::with_timeout(
            &config.base_url,
            config.request_timeout,
        )?);
        let cache = CacheStore::with_config(store.clone(), config.cache.clone());
        let queue = OfflineQueue::new(store.clone());
        let manager = SyncManager::new(
            api.clone(),
            cache.clone(),
            queue.clone(),
            monitor.clone(),
            store.clone(),
            config.retry_budget,
        );

        Ok(Self {
            store,
            api,
            cache,
            queue,
            monitor,
            manager,
        })
    }

    /// The sync manager, main entry point for reads, submits and sync passes.
    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// The backing store, for app-level key/value persistence beside the
    /// sync state.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Arm the reconnect reaction: a sync pass runs whenever connectivity
    /// comes back. Drop the subscription to disarm.
    pub fn watch_connectivity(&self) -> Subscription {
        self.manager.watch_connectivity()
    }
}
