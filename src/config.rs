//! Core configuration
//!
//! Explicit, constructor-injected settings for assembling the sync core. The
//! defaults encode the shipped policy (retry budget, freshness windows, HTTP
//! timeouts); deployments with different tolerances override fields before
//! handing the config to `OfflineCore::open`.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheConfig;

/// Failed replay attempts before a queued action is dropped. Bounds queue
/// growth from a permanently failing action while tolerating transient blips.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Per-request timeout; expiry counts as a transport failure.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reachability probes must fail fast.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Assembly configuration for the sync core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Base URL of the REST API, e.g. "https://api.koinonia.app/v1".
    pub base_url: String,

    /// SQLite file backing the persistent store. None resolves to the
    /// platform data directory.
    pub store_path: Option<PathBuf>,

    /// Timeout applied to every API request.
    pub request_timeout: Duration,

    /// Timeout applied to reachability probes.
    pub probe_timeout: Duration,

    /// Failed replay attempts before a queued action is dropped.
    pub retry_budget: u32,

    /// Cache tuning (freshness windows, hot-layer capacity).
    pub cache: CacheConfig,
}

impl CoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            store_path: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            cache: CacheConfig::default(),
        }
    }

    /// The store path to use, falling back to the platform default.
    pub fn resolve_store_path(&self) -> PathBuf {
        match &self.store_path {
            Some(path) => path.clone(),
            None => default_store_path(),
        }
    }
}

/// Default SQLite location under the platform data directory.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("koinonia")
        .join("sync.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::new("https://api.example.org");

        assert_eq!(config.base_url, "https://api.example.org");
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.store_path.is_none());
    }

    #[test]
    fn test_store_path_override_wins() {
        let mut config = CoreConfig::new("https://api.example.org");
        config.store_path = Some(PathBuf::from("/tmp/custom/sync.db"));

        assert_eq!(
            config.resolve_store_path(),
            PathBuf::from("/tmp/custom/sync.db")
        );
    }

    #[test]
    fn test_default_store_path_names_the_app() {
        let path = default_store_path();
        assert!(path.ends_with("koinonia/sync.db"));
    }
}
