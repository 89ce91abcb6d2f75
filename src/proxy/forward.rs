use crate::cache::policy;
use crate::error::ProxyError;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::server::ProxyState;
use crate::upstream::Reservation;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::BodyExt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request body handed to the forwarding engine: buffered when the cache
/// phase already read it for hashing, streamed straight through otherwise.
pub enum ForwardBody {
    Buffered(Bytes),
    Streaming(BoxBody),
}

/// Headers scoped to a single network hop; never forwarded, never stored.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Round-trip one request to the reserved upstream and buffer the exchange.
///
/// The reservation is upgraded to an in-flight slot around the round-trip;
/// every return path drops the guard, so load counters balance regardless of
/// outcome. The full response body is read into memory; concurrent memory
/// is bounded by the queue's `max_concurrent` times the largest response.
pub async fn forward(
    state: &ProxyState,
    ctx: &mut RequestContext,
    mut headers: HeaderMap,
    body: ForwardBody,
    reservation: Reservation,
    cancel: &CancellationToken,
) -> Result<hyper::Response<BoxBody>, ProxyError> {
    let target = reservation.target().clone();
    ctx.upstream = target.authority().to_string();

    let uri = target.url_for(&ctx.path, ctx.query.as_deref());

    remove_hop_headers(&mut headers);
    inject_forwarded_headers(&mut headers, ctx);
    headers.insert(
        HOST,
        HeaderValue::from_str(target.authority()).unwrap_or_else(|_| HeaderValue::from_static("")),
    );

    let mut builder = hyper::Request::builder().method(ctx.method.clone()).uri(&uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let req_body: BoxBody = match body {
        ForwardBody::Buffered(bytes) => full_body(bytes),
        ForwardBody::Streaming(stream) => stream,
    };
    let upstream_req = builder
        .body(req_body)
        .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;

    let guard = reservation.acquire();
    ctx.upstream_start = Some(Instant::now());

    let upstream_resp = match state.client.request(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            drop(guard);
            return Err(if cancel.is_cancelled() {
                ProxyError::ClientGone(e.to_string())
            } else {
                ProxyError::UpstreamConnect(e.to_string())
            });
        }
    };

    let (parts, resp_body) = upstream_resp.into_parts();
    let body = match resp_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            drop(guard);
            return Err(ProxyError::UpstreamBody(e.to_string()));
        }
    };
    drop(guard);

    let mut resp_headers = parts.headers;
    remove_hop_headers(&mut resp_headers);
    if !resp_headers.contains_key(CONTENT_LENGTH) {
        resp_headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    }

    // Store before the X-Cache label goes on: the label describes this
    // exchange, not the entry a later request replays.
    if let Some(key) = &ctx.cache_key {
        if policy::response_cacheable(parts.status, &resp_headers) {
            let ttl = policy::response_ttl(&resp_headers);
            state
                .cache
                .set(key, parts.status, resp_headers.clone(), body.clone(), ttl);
        }
    }

    let mut builder = hyper::Response::builder().status(parts.status);
    for (name, value) in &resp_headers {
        builder = builder.header(name, value);
    }
    let mut resp = builder.body(full_body(body)).unwrap();
    resp.headers_mut().insert(
        HeaderName::from_static("x-cache"),
        HeaderValue::from_static(ctx.cache_label.as_str()),
    );
    Ok(resp)
}

/// Standard forwarding headers for the upstream: append the TCP peer to
/// `X-Forwarded-For`, set `X-Forwarded-Proto` from TLS presence unless a
/// front hop already set it, and carry the original host in
/// `X-Forwarded-Host`.
fn inject_forwarded_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");

    let peer_ip = ctx.peer_ip.to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(
            XFP.clone(),
            HeaderValue::from_static(if ctx.tls { "https" } else { "http" }),
        );
    }

    if !ctx.host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&ctx.host) {
            headers.insert(XFH.clone(), v);
        }
    }
}
