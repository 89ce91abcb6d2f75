//! Cacheability rules applied by the forwarding engine. The store itself
//! never decides what goes in.

use http::{header, HeaderMap, Method, StatusCode};
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::time::{Duration, SystemTime};

/// Statuses eligible for storage. Deliberately includes 204/404/410, which
/// the fleet's origins mark cacheable with explicit directives.
const CACHEABLE_STATUS: &[u16] = &[200, 203, 204, 300, 301, 404, 410];

fn cache_control(headers: &HeaderMap) -> &str {
    headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Directive match by exact name or `name=value` form.
fn has_directive(cache_control: &str, directive: &str) -> bool {
    cache_control.split(',').map(|d| d.trim()).any(|d| {
        d.eq_ignore_ascii_case(directive)
            || (d.len() > directive.len()
                && d.as_bytes()[directive.len()] == b'='
                && d[..directive.len()].eq_ignore_ascii_case(directive))
    })
}

fn directive_value(cache_control: &str, directive: &str) -> Option<u64> {
    for d in cache_control.split(',') {
        let d = d.trim();
        if d.len() > directive.len()
            && d.as_bytes()[directive.len()] == b'='
            && d[..directive.len()].eq_ignore_ascii_case(directive)
        {
            return d[directive.len() + 1..].trim().parse().ok();
        }
    }
    None
}

/// Request-side eligibility: no `no-store` / `no-cache`; an `Authorization`
/// header is only acceptable alongside an explicit `public`.
///
/// The method is intentionally not consulted: bodied methods cache when
/// their request/response pairs pass the directive checks.
pub fn request_cacheable(headers: &HeaderMap) -> bool {
    let cc = cache_control(headers);
    if has_directive(cc, "no-store") || has_directive(cc, "no-cache") {
        return false;
    }
    if headers.contains_key(header::AUTHORIZATION) && !has_directive(cc, "public") {
        return false;
    }
    true
}

/// Response-side eligibility: status in the cacheable set and no `no-store`.
pub fn response_cacheable(status: StatusCode, headers: &HeaderMap) -> bool {
    if !CACHEABLE_STATUS.contains(&status.as_u16()) {
        return false;
    }
    !has_directive(cache_control(headers), "no-store")
}

/// TTL derivation, first match wins: `s-maxage`, `max-age`, a future
/// `Expires`. Zero means "no explicit lifetime" and the store substitutes
/// the configured default.
pub fn response_ttl(headers: &HeaderMap) -> Duration {
    let cc = cache_control(headers);
    if let Some(secs) = directive_value(cc, "s-maxage") {
        return Duration::from_secs(secs);
    }
    if let Some(secs) = directive_value(cc, "max-age") {
        return Duration::from_secs(secs);
    }
    if let Some(expires) = headers.get(header::EXPIRES).and_then(|v| v.to_str().ok()) {
        if let Ok(at) = httpdate::parse_http_date(expires) {
            if let Ok(ttl) = at.duration_since(SystemTime::now()) {
                return ttl;
            }
        }
    }
    Duration::ZERO
}

/// Deterministic cache key.
///
/// `host` is the client-facing host, not the picked upstream, so different
/// balancer choices share entries. `path` is the rewritten path (target base
/// path joined with the request path). The body hash keeps two bodied
/// requests with different payloads on different keys.
pub fn cache_key(
    method: &Method,
    scheme: &str,
    host: &str,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> String {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let accept_encoding = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut key = String::with_capacity(
        method.as_str().len() + scheme.len() + host.len() + path.len() + 96,
    );
    key.push_str(method.as_str());
    key.push(' ');
    key.push_str(scheme);
    key.push_str("://");
    key.push_str(host);
    key.push_str(path);
    if let Some(q) = query {
        if !q.is_empty() {
            key.push('?');
            key.push_str(q);
        }
    }
    key.push_str("|a=");
    key.push_str(accept);
    key.push_str("|ae=");
    key.push_str(accept_encoding);

    if !body.is_empty() {
        key.push_str("|bh=");
        let digest = Sha256::digest(body);
        for byte in digest {
            let _ = write!(key, "{:02x}", byte);
        }
    }
    key
}
