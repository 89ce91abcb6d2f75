use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::Request;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Cache disposition of one request, surfaced in `X-Cache` and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLabel {
    Hit,
    Miss,
    /// Caching was never attempted for this request.
    Bypass,
}

impl CacheLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLabel::Hit => "HIT",
            CacheLabel::Miss => "MISS",
            CacheLabel::Bypass => "BYPASS",
        }
    }
}

/// Per-request context that flows through the router and forwarding engine.
/// Carries the cache-phase decisions (key, label) and the chosen upstream so
/// the forward phase never re-derives them.
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Client-facing host, which the cache key is built from.
    pub host: String,
    /// Logical client address (left-most trusted X-Forwarded-For entry,
    /// falling back to the TCP peer).
    pub client_ip: IpAddr,
    /// The immediate TCP peer; appended to the outbound X-Forwarded-For.
    pub peer_ip: IpAddr,
    pub request_id: String,
    pub tls: bool,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
    /// Authority of the chosen upstream, for logs and metric labels.
    pub upstream: String,
    pub cache_label: CacheLabel,
    pub cache_key: Option<String>,
}

impl RequestContext {
    pub fn new(req: &Request<Incoming>, peer_addr: SocketAddr, tls: bool) -> Self {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let client_ip = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
            .unwrap_or_else(|| peer_addr.ip());

        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(|q| q.to_string()),
            host,
            client_ip,
            peer_ip: peer_addr.ip(),
            request_id: uuid::Uuid::new_v4().to_string(),
            tls,
            start: Instant::now(),
            upstream_start: None,
            upstream: String::new(),
            cache_label: CacheLabel::Bypass,
            cache_key: None,
        }
    }

    /// Build a JSON error response and record metrics in one place: the
    /// single exit point for every error path after the in-flight gauge was
    /// bumped.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        self.record_request_metrics(status.as_u16());
        metrics::gauge!("proxy_http_requests_in_flight").decrement(1.0);

        tracing::warn!(
            request_id = %self.request_id,
            method = %self.method,
            path = %self.path,
            status = status.as_u16(),
            upstream = %self.upstream,
            cache = self.cache_label.as_str(),
            "proxy: {}",
            msg
        );

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }

    /// Record final metrics for a response that is going out as-is.
    pub fn finalize_metrics(&self, resp_status: u16) {
        self.record_request_metrics(resp_status);
        metrics::gauge!("proxy_http_requests_in_flight").decrement(1.0);
    }

    fn record_request_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "proxy_http_requests_total",
            "method" => self.method.as_str().to_owned(),
            "status_code" => status_str.to_owned(),
            "upstream" => self.upstream.clone(),
            "cache" => self.cache_label.as_str(),
        )
        .increment(1);

        metrics::histogram!(
            "proxy_http_request_duration_seconds",
            "upstream" => self.upstream.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "proxy_upstream_request_duration_seconds",
                "upstream" => self.upstream.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }
}
