use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::proxy::BoxBody;
use crate::queue::AdmissionQueue;
use crate::upstream::{Balancer, HealthProber, Strategy, Target};
use anyhow::Result;
use arc_swap::ArcSwap;
use http::Method;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Shared proxy state, cheaply cloneable — one per process.
///
/// The balancer sits behind an `ArcSwap` so a strategy reconfiguration
/// replaces it wholesale; requests in flight keep their reservations against
/// the old value's counters, which the swap leaves untouched.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<ProxyConfig>,
    pub balancer: Arc<ArcSwap<Balancer>>,
    pub cache: Arc<ResponseCache>,
    pub queue: Arc<AdmissionQueue>,
    pub metrics: Metrics,
    pub client: HttpClient,
    targets: Arc<Vec<Arc<Target>>>,
    allowed: Option<Arc<HashSet<Method>>>,
    allow_header: Arc<str>,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let targets = Arc::new(config.parsed_targets()?);
        let balancer = Balancer::new(
            config.strategy()?,
            targets.as_ref().clone(),
            config.load_balancer_health_check,
            HealthProber::new(),
        );
        let cache = ResponseCache::new(config.cache.max_entries, config.cache_ttl());
        let queue = AdmissionQueue::new(
            config.queue.max_queue,
            config.queue.max_concurrent,
            config.enqueue_timeout(),
        );
        let metrics = Metrics::install();
        let (allowed, allow_header) = build_allowlist(&config.allowed_methods)?;

        Ok(Self {
            config: Arc::new(config),
            balancer: Arc::new(ArcSwap::from_pointee(balancer)),
            cache: Arc::new(cache),
            queue: Arc::new(queue),
            metrics,
            client: build_http_client(),
            targets,
            allowed,
            allow_header,
        })
    }

    pub fn method_allowed(&self, method: &Method) -> bool {
        match &self.allowed {
            Some(set) => set.contains(method),
            None => true,
        }
    }

    /// Sorted allowed methods for the 405 `Allow` header.
    pub fn allow_header(&self) -> &str {
        &self.allow_header
    }

    /// Swap in a freshly-built balancer. Counters never carry over; callers
    /// must not assume continuity across a reconfiguration.
    pub fn replace_balancer(&self, strategy: Strategy, health_check: bool) {
        let balancer = Balancer::new(
            strategy,
            self.targets.as_ref().clone(),
            health_check,
            HealthProber::new(),
        );
        self.balancer.store(Arc::new(balancer));
        tracing::info!(
            "balancer: replaced, strategy={}, health_check={}",
            strategy.as_str(),
            health_check
        );
    }
}

#[allow(clippy::type_complexity)]
fn build_allowlist(methods: &[String]) -> Result<(Option<Arc<HashSet<Method>>>, Arc<str>)> {
    if methods.is_empty() {
        return Ok((None, Arc::from("")));
    }
    let mut set = HashSet::with_capacity(methods.len());
    for m in methods {
        set.insert(m.parse::<Method>()?);
    }
    let mut names: Vec<&str> = methods.iter().map(|m| m.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    Ok((Some(Arc::new(set)), Arc::from(names.join(", "))))
}

/// One shared upstream client: pooled keep-alive connections, HTTP/2 via
/// ALPN on TLS, 30 s dial timeout, 90 s idle timeout. TLS establishment is
/// bounded together with the dial.
fn build_http_client() -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(POOL_IDLE_TIMEOUT));
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(https)
}
