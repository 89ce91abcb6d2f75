use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level proxy configuration. Every option has the documented default;
/// only `targets` is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listen address. A bare ":port" is normalized to "0.0.0.0:port".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Upstream origin URLs. At least one is required.
    #[serde(default)]
    pub targets: Vec<String>,

    /// "rr" or "least_conn".
    #[serde(default = "default_strategy")]
    pub load_balancer_strategy: String,

    /// Probe candidates on every pick and skip unhealthy ones.
    #[serde(default = "default_true")]
    pub load_balancer_health_check: bool,

    /// Methods accepted by the proxy; others get 405. An empty list disables
    /// the allowlist entirely.
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            targets: Vec::new(),
            load_balancer_strategy: default_strategy(),
            load_balancer_health_check: true,
            allowed_methods: default_allowed_methods(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Default entry lifetime when the response carries no explicit one.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Waiting-room capacity; overflow is rejected with 429.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    /// Concurrent upstream exchanges.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long a request may wait for an active slot before 503.
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    /// Attach X-Queue-* diagnostics to admitted responses.
    #[serde(default = "default_true")]
    pub queue_wait_header: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue: default_max_queue(),
            max_concurrent: default_max_concurrent(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            queue_wait_header: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl ProxyConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.enqueue_timeout_ms)
    }
}

fn default_listen() -> String {
    ":8080".to_string()
}

fn default_strategy() -> String {
    "rr".to_string()
}

fn default_true() -> bool {
    true
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_cache_max_entries() -> usize {
    2048
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_max_queue() -> usize {
    1000
}

fn default_max_concurrent() -> usize {
    100
}

fn default_enqueue_timeout_ms() -> u64 {
    2000
}
