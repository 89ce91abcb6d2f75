use crate::cache::policy;
use crate::cache::CachedResponse;
use crate::error::ProxyError;
use crate::proxy::context::{full_body, BoxBody, CacheLabel, RequestContext};
use crate::proxy::forward::{self, ForwardBody};
use crate::server::ProxyState;
use crate::upstream::Target;
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Handle one incoming request through the fixed lifecycle:
///
/// 1. health/metrics termination
/// 2. method allowlist
/// 3. balancer preview pick (cache key + URL shape only)
/// 4. cache lookup (a fresh HIT short-circuits here)
/// 5. balancer committing pick
/// 6. queue admission, then the forwarding engine
///
/// Any deviation from this ordering is a bug.
pub async fn handle_request(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
    tls: bool,
) -> Result<Response<BoxBody>, hyper::Error> {
    // Terminal endpoints never see the allowlist, cache, queue, or balancer.
    match req.uri().path() {
        "/healthz" => {
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; charset=utf-8")
                .body(full_body("ok"))
                .unwrap());
        }
        "/metrics" => {
            let body = state.metrics.render();
            return Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap());
        }
        _ => {}
    }

    let mut ctx = RequestContext::new(&req, peer_addr, tls);
    metrics::gauge!("proxy_http_requests_in_flight").increment(1.0);

    if !state.method_allowed(req.method()) {
        let mut resp = ctx.error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        if let Ok(v) = HeaderValue::from_str(state.allow_header()) {
            resp.headers_mut().insert(header::ALLOW, v);
        }
        return Ok(resp);
    }

    let (parts, body) = req.into_parts();
    let headers = parts.headers;

    let balancer = state.balancer.load_full();
    let preview = balancer.preview().await;

    let fwd_body = match phase_cache(&state, &mut ctx, &preview, &headers, body).await {
        Ok(CacheOutcome::Hit(resp)) => {
            let status = resp.status().as_u16();
            access_log(&ctx, status);
            ctx.finalize_metrics(status);
            return Ok(resp);
        }
        Ok(CacheOutcome::Forward(fwd_body)) => fwd_body,
        Err(resp) => return Ok(resp),
    };

    // Committing pick; overrides the preview in the request context.
    let reservation = match balancer.pick().await {
        Some(r) => r,
        None => {
            let e = ProxyError::NoUpstream;
            return Ok(ctx.error_response(e.status(), &e.to_string()));
        }
    };
    ctx.upstream = reservation.target().authority().to_string();

    let admission = match state.queue.admit(&cancel).await {
        Ok(a) => a,
        Err(e) => {
            let e = ProxyError::from(e);
            return Ok(ctx.error_response(e.status(), &e.to_string()));
        }
    };
    let depth_at_entry = admission.depth_at_entry;
    let waited = admission.waited;

    let result = forward::forward(&state, &mut ctx, headers, fwd_body, reservation, &cancel).await;
    // The inner handler is done; give the active slot back before the
    // response is written downstream.
    drop(admission);

    // The request was admitted, so the queue diagnostics apply to error
    // responses from the exchange as well.
    match result {
        Ok(mut resp) => {
            if state.config.queue.queue_wait_header {
                apply_queue_headers(resp.headers_mut(), &state, depth_at_entry, waited);
            }
            let status = resp.status().as_u16();
            access_log(&ctx, status);
            ctx.finalize_metrics(status);
            Ok(resp)
        }
        Err(e) => {
            let mut resp = ctx.error_response(e.status(), &e.to_string());
            if state.config.queue.queue_wait_header {
                apply_queue_headers(resp.headers_mut(), &state, depth_at_entry, waited);
            }
            Ok(resp)
        }
    }
}

enum CacheOutcome {
    Hit(Response<BoxBody>),
    Forward(ForwardBody),
}

/// Cache phase: decide HIT / MISS / BYPASS and prepare the forward body.
///
/// Buffers and hashes the request body only when the request is cache
/// eligible; everything else streams through untouched. The preview target
/// supplies the rewritten path and scheme for the key; the key's host stays
/// client-facing so balancer choice never fragments the cache.
async fn phase_cache(
    state: &ProxyState,
    ctx: &mut RequestContext,
    preview: &Option<Arc<Target>>,
    headers: &HeaderMap,
    body: Incoming,
) -> Result<CacheOutcome, Response<BoxBody>> {
    let target = match preview {
        Some(t) if state.config.cache.enabled && policy::request_cacheable(headers) => t,
        _ => {
            ctx.cache_label = CacheLabel::Bypass;
            metrics::counter!("proxy_cache_bypass_total").increment(1);
            return Ok(CacheOutcome::Forward(ForwardBody::Streaming(body.boxed())));
        }
    };

    // Hashing consumes the body; the buffered bytes are restored into the
    // outbound request by the forwarding engine.
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(
                request_id = %ctx.request_id,
                "proxy: failed to read request body, error={}", e
            );
            return Err(ctx.error_response(StatusCode::BAD_REQUEST, "bad request"));
        }
    };

    let rewritten_path = target.join_path(&ctx.path);
    let key = policy::cache_key(
        &ctx.method,
        target.scheme(),
        &ctx.host,
        &rewritten_path,
        ctx.query.as_deref(),
        headers,
        &bytes,
    );

    if let Some((entry, stale)) = state.cache.get(&key) {
        if !stale {
            ctx.cache_label = CacheLabel::Hit;
            metrics::counter!("proxy_cache_hits_total").increment(1);
            return Ok(CacheOutcome::Hit(hit_response(entry)));
        }
    }

    ctx.cache_label = CacheLabel::Miss;
    ctx.cache_key = Some(key);
    metrics::counter!("proxy_cache_misses_total").increment(1);
    Ok(CacheOutcome::Forward(ForwardBody::Buffered(bytes)))
}

/// Replay a stored entry: stored headers, `Age` in whole seconds, HIT label.
/// No balancer slot is involved; hits never dispatch upstream.
fn hit_response(entry: CachedResponse) -> Response<BoxBody> {
    let mut builder = Response::builder().status(entry.status);
    for (name, value) in &entry.headers {
        builder = builder.header(name, value);
    }
    let age = entry.age_secs(Instant::now());
    let mut resp = builder.body(full_body(entry.body)).unwrap();
    resp.headers_mut().insert(header::AGE, HeaderValue::from(age));
    resp.headers_mut().insert(
        HeaderName::from_static("x-cache"),
        HeaderValue::from_static("HIT"),
    );
    resp
}

fn apply_queue_headers(
    headers: &mut HeaderMap,
    state: &ProxyState,
    depth_at_entry: i64,
    waited: Duration,
) {
    headers.insert(
        HeaderName::from_static("x-concurrency-limit"),
        HeaderValue::from(state.queue.max_concurrent() as u64),
    );
    headers.insert(
        HeaderName::from_static("x-queue-limit"),
        HeaderValue::from(state.queue.max_queue() as u64),
    );
    headers.insert(
        HeaderName::from_static("x-queue-depth"),
        HeaderValue::from(depth_at_entry.max(0) as u64),
    );
    if let Ok(v) = HeaderValue::from_str(&format!("{}ms", waited.as_millis())) {
        headers.insert(HeaderName::from_static("x-queue-wait"), v);
    }
}

/// One structured line per completed request.
fn access_log(ctx: &RequestContext, status: u16) {
    let upstream_ms = ctx
        .upstream_start
        .map(|t| t.elapsed().as_millis())
        .unwrap_or(0);

    tracing::info!(
        request_id = %ctx.request_id,
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.path,
        status,
        upstream = %ctx.upstream,
        cache = ctx.cache_label.as_str(),
        latency_ms = %ctx.start.elapsed().as_millis(),
        upstream_ms = %upstream_ms,
        "access"
    );
}
