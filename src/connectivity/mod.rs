//! Connectivity monitoring - single source of truth for online/offline
//!
//! Tracks whether the backend is worth talking to:
//! - Push path: the app reports OS-level connectivity signals
//! - Pull path: an optional HTTP probe checks real reachability
//! - Change handlers fire on transitions only, never on repeats
//! - A connected link behind a captive portal counts as offline

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use url::Url;

// ============================================================================
// Probes
// ============================================================================

/// Answers one question: did the backend respond at all?
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Reachability probe that issues GET requests against a fixed URL.
///
/// Any HTTP answer counts as reachable, error statuses included; only
/// transport failures (DNS, connect, timeout) count against the backend.
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, MonitorError> {
        let url = Url::parse(url).map_err(|e| MonitorError::Probe(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MonitorError::Probe(e.to_string()))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl NetworkProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.get(self.url.clone()).send().await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Reachability probe failed: {}", e);
                false
            }
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Connectivity polling is already running")]
    AlreadyRunning,

    #[error("Connectivity polling is not running")]
    NotRunning,

    #[error("No probe configured")]
    NoProbe,

    #[error("Probe error: {0}")]
    Probe(String),
}

// ============================================================================
// Monitor
// ============================================================================

type ChangeHandler = Arc<dyn Fn(bool) + Send + Sync>;
type HandlerMap = StdMutex<HashMap<u64, ChangeHandler>>;

/// Handle returned by [`ConnectivityMonitor::on_change`]. Dropping it
/// unsubscribes the handler.
pub struct Subscription {
    id: u64,
    handlers: Weak<HandlerMap>,
}

impl Subscription {
    /// Unsubscribe explicitly. Equivalent to dropping the subscription.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            if let Ok(mut map) = handlers.lock() {
                map.remove(&self.id);
            }
        }
    }
}

/// Tracks online/offline state and notifies subscribers on transitions.
///
/// Handlers run on the thread that observed the transition, outside the
/// monitor's internal lock, so a callback may report further state changes
/// or manage subscriptions. A subscription cancelled mid-dispatch still
/// observes the transition already being delivered.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    online: Arc<AtomicBool>,
    handlers: Arc<HandlerMap>,
    next_handler_id: Arc<AtomicU64>,
    probe: Option<Arc<dyn NetworkProbe>>,
    polling: Arc<AtomicBool>,
    poll_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectivityMonitor {
    /// Monitor fed purely by [`report`](Self::report) calls.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Monitor that can additionally verify reachability via `probe`.
    pub fn with_probe(probe: Arc<dyn NetworkProbe>) -> Self {
        Self::build(Some(probe))
    }

    fn build(probe: Option<Arc<dyn NetworkProbe>>) -> Self {
        Self {
            // Optimistic until told otherwise: the first sync attempt will
            // discover the truth and report back.
            online: Arc::new(AtomicBool::new(true)),
            handlers: Arc::new(StdMutex::new(HashMap::new())),
            next_handler_id: Arc::new(AtomicU64::new(0)),
            probe,
            polling: Arc::new(AtomicBool::new(false)),
            poll_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Feed in an OS-level connectivity signal.
    ///
    /// `connected` is the link state, `reachable` whether the backend
    /// answered. Both must hold to count as online; a live link behind a
    /// captive portal is offline for sync purposes.
    pub fn report(&self, connected: bool, reachable: bool) {
        if connected && !reachable {
            log::warn!("Network link present but backend unreachable, treating as offline");
        }
        self.set_online(connected && reachable);
    }

    /// Register a handler invoked with the new state on every transition.
    pub fn on_change(&self, handler: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        match self.handlers.lock() {
            Ok(mut map) => {
                map.insert(id, Arc::new(handler));
            }
            Err(e) => {
                log::error!("Failed to lock connectivity handlers: {}", e);
            }
        }

        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Probe reachability once and update state. Without a probe this simply
    /// returns the current state.
    pub async fn refresh(&self) -> bool {
        match &self.probe {
            Some(probe) => {
                let reachable = probe.is_reachable().await;
                self.set_online(reachable);
                reachable
            }
            None => self.is_online(),
        }
    }

    /// Start probing reachability every `interval`. The first probe fires
    /// immediately.
    pub async fn start_polling(&self, interval: Duration) -> Result<(), MonitorError> {
        if self.probe.is_none() {
            return Err(MonitorError::NoProbe);
        }
        if self.polling.load(Ordering::Relaxed) {
            return Err(MonitorError::AlreadyRunning);
        }
        self.polling.store(true, Ordering::Relaxed);

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            monitor.poll_loop(interval).await;
        });
        *self.poll_task.lock().await = Some(handle);

        log::info!("Connectivity polling started (interval: {:?})", interval);
        Ok(())
    }

    /// Stop the polling task.
    pub async fn stop_polling(&self) -> Result<(), MonitorError> {
        if !self.polling.load(Ordering::Relaxed) {
            return Err(MonitorError::NotRunning);
        }
        self.polling.store(false, Ordering::Relaxed);

        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }

        log::info!("Connectivity polling stopped");
        Ok(())
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Relaxed)
    }

    async fn poll_loop(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;

            if !self.polling.load(Ordering::Relaxed) {
                log::info!("Connectivity poll loop stopping");
                break;
            }

            self.refresh().await;
        }
    }

    fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }

        log::info!(
            "Connectivity changed: {} -> {}",
            state_label(previous),
            state_label(online)
        );
        self.dispatch(online);
    }

    fn dispatch(&self, online: bool) {
        // Snapshot under the lock, invoke outside it: a handler may re-enter
        // report/refresh or drop a Subscription without deadlocking.
        let snapshot: Vec<ChangeHandler> = match self.handlers.lock() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(e) => {
                log::error!("Failed to lock connectivity handlers: {}", e);
                return;
            }
        };

        for handler in snapshot {
            handler(online);
        }
    }
}

fn state_label(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "offline"
    }
}

// ============================================================================
// Tests
// ============================================================================
