use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency and queue-wait metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static INSTALLED: OnceLock<Metrics> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) work anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Idempotent: later calls return the first handle, so
    /// test binaries can build several proxy states in one process.
    pub fn install() -> Self {
        INSTALLED.get_or_init(Self::install_recorder).clone()
    }

    fn install_recorder() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full("proxy_queue_wait_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "proxy_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "proxy_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "proxy_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream round-trip duration"
        );
        describe_gauge!(
            "proxy_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );

        // cache
        describe_counter!(
            "proxy_cache_hits_total",
            Unit::Count,
            "Requests served from the response cache"
        );
        describe_counter!(
            "proxy_cache_misses_total",
            Unit::Count,
            "Cache-eligible requests not found fresh in the cache"
        );
        describe_counter!(
            "proxy_cache_bypass_total",
            Unit::Count,
            "Requests for which caching was not attempted"
        );
        describe_counter!(
            "proxy_cache_evictions_total",
            Unit::Count,
            "Entries evicted by the LRU policy"
        );
        describe_gauge!(
            "proxy_cache_entries",
            Unit::Count,
            "Entries currently stored in the cache"
        );

        // admission queue
        describe_counter!(
            "proxy_queue_rejected_total",
            Unit::Count,
            "Requests rejected because the waiting room was full"
        );
        describe_counter!(
            "proxy_queue_timeouts_total",
            Unit::Count,
            "Requests that timed out waiting for an active slot"
        );
        describe_gauge!(
            "proxy_queue_depth",
            Unit::Count,
            "Requests currently holding a waiting slot"
        );
        describe_histogram!(
            "proxy_queue_wait_seconds",
            Unit::Seconds,
            "Time spent queued before admission, timeout, or cancellation"
        );

        // upstream health
        describe_counter!(
            "proxy_health_probe_total",
            Unit::Count,
            "Per-pick upstream health probe results"
        );

        // connections
        describe_gauge!(
            "proxy_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "proxy_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
