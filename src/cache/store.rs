use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One buffered upstream response held by the cache. Hop-by-hop headers are
/// removed by the forwarding engine before storage.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CachedResponse {
    /// Whole seconds since the entry was stored, clamped to >= 0.
    pub fn age_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.stored_at).as_secs()
    }
}

/// Point-in-time counters, taken under the same mutex as the store itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

const NIL: usize = usize::MAX;

struct Node {
    key: String,
    entry: CachedResponse,
    prev: usize,
    next: usize,
}

/// Recency-ordered storage: hash map for lookup, index-linked list for LRU
/// order. head = most recently used, tail = least recently used. Freed slab
/// slots are recycled through the free list.
struct LruInner {
    map: HashMap<String, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl LruInner {
    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("live cache node")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("live cache node")
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let n = self.node(idx);
            (n.prev, n.next)
        };
        if prev != NIL {
            self.node_mut(prev).next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.node_mut(next).prev = prev;
        } else {
            self.tail = prev;
        }
        let n = self.node_mut(idx);
        n.prev = NIL;
        n.next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let n = self.node_mut(idx);
            n.prev = NIL;
            n.next = old_head;
        }
        if old_head != NIL {
            self.node_mut(old_head).prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn remove(&mut self, idx: usize) -> Node {
        self.detach(idx);
        let node = self.nodes[idx].take().expect("live cache node");
        self.free.push(idx);
        self.map.remove(&node.key);
        node
    }
}

/// Fixed-capacity response cache with per-entry TTL and LRU eviction.
///
/// One mutex covers the map and the recency list together; critical
/// sections are small and never touch I/O. The invariants (map size equals
/// list size, size <= capacity after insertion, tail is the eviction
/// victim) hold at every unlock.
pub struct ResponseCache {
    inner: Mutex<LruInner>,
    capacity: usize,
    default_ttl: Duration,
}

impl ResponseCache {
    /// `capacity` must be positive (enforced by config validation);
    /// `default_ttl` replaces non-positive TTLs handed to [`Self::set`].
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::with_capacity(capacity.min(4096)),
                nodes: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruInner> {
        self.inner.lock().expect("cache mutex poisoned")
    }

    /// Look up a key. Presence moves the entry to the front of the recency
    /// list even when stale; the bool is the staleness flag. A stale lookup
    /// counts as a miss, never a hit.
    pub fn get(&self, key: &str) -> Option<(CachedResponse, bool)> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.map.get(key).copied() {
            Some(idx) => {
                inner.move_to_front(idx);
                let entry = inner.node(idx).entry.clone();
                let stale = now > entry.expires_at;
                if stale {
                    inner.misses += 1;
                } else {
                    inner.hits += 1;
                }
                Some((entry, stale))
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert at the front, replacing in place when the key exists. A zero
    /// TTL falls back to the configured default. Overflow evicts exactly the
    /// least-recently-used entry.
    pub fn set(&self, key: &str, status: StatusCode, headers: HeaderMap, body: Bytes, ttl: Duration) {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let now = Instant::now();
        let entry = CachedResponse {
            status,
            headers,
            body,
            stored_at: now,
            expires_at: now + ttl,
        };

        let mut inner = self.lock();
        if let Some(idx) = inner.map.get(key).copied() {
            inner.node_mut(idx).entry = entry;
            inner.move_to_front(idx);
            return;
        }

        let idx = inner.alloc(Node {
            key: key.to_string(),
            entry,
            prev: NIL,
            next: NIL,
        });
        inner.map.insert(key.to_string(), idx);
        inner.push_front(idx);

        if inner.map.len() > self.capacity {
            let victim = inner.tail;
            inner.remove(victim);
            inner.evictions += 1;
            metrics::counter!("proxy_cache_evictions_total").increment(1);
        }
        metrics::gauge!("proxy_cache_entries").set(inner.map.len() as f64);
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.lock();
        match inner.map.get(key).copied() {
            Some(idx) => {
                inner.remove(idx);
                metrics::gauge!("proxy_cache_entries").set(inner.map.len() as f64);
                true
            }
            None => false,
        }
    }

    /// Drop every entry; counters survive.
    pub fn purge(&self) {
        let mut inner = self.lock();
        inner.map.clear();
        inner.nodes.clear();
        inner.free.clear();
        inner.head = NIL;
        inner.tail = NIL;
        metrics::gauge!("proxy_cache_entries").set(0.0);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.map.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize, ttl_secs: u64) -> ResponseCache {
        ResponseCache::new(capacity, Duration::from_secs(ttl_secs))
    }

    fn put(c: &ResponseCache, key: &str, ttl: Duration) {
        c.set(
            key,
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from(format!("body:{}", key)),
            ttl,
        );
    }

    #[test]
    fn test_get_miss_then_hit() {
        let c = cache(4, 60);
        assert!(c.get("k").is_none());

        put(&c, "k", Duration::ZERO);
        let (entry, stale) = c.get("k").unwrap();
        assert!(!stale);
        assert_eq!(entry.body, Bytes::from("body:k"));

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_stale_entry_counts_as_miss() {
        let c = cache(4, 60);
        put(&c, "k", Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(5));

        let (_, stale) = c.get("k").unwrap();
        assert!(stale);

        let stats = c.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_zero_ttl_uses_default() {
        let c = cache(4, 60);
        put(&c, "k", Duration::ZERO);
        let (entry, stale) = c.get("k").unwrap();
        assert!(!stale);
        let ttl = entry.expires_at.duration_since(entry.stored_at);
        assert_eq!(ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_lru_eviction_order() {
        let c = cache(2, 60);
        put(&c, "a", Duration::ZERO);
        put(&c, "b", Duration::ZERO);

        // Touch a so b becomes the LRU victim.
        c.get("a");
        put(&c, "c", Duration::ZERO);

        assert!(c.get("a").is_some());
        assert!(c.get("b").is_none());
        assert!(c.get("c").is_some());
        assert_eq!(c.stats().evictions, 1);
        assert_eq!(c.stats().entries, 2);
    }

    #[test]
    fn test_replace_in_place_keeps_size() {
        let c = cache(2, 60);
        put(&c, "a", Duration::ZERO);
        c.set(
            "a",
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            Bytes::from_static(b"v2"),
            Duration::ZERO,
        );

        let (entry, _) = c.get("a").unwrap();
        assert_eq!(entry.status, StatusCode::NOT_FOUND);
        assert_eq!(entry.body, Bytes::from_static(b"v2"));
        assert_eq!(c.stats().entries, 1);
        assert_eq!(c.stats().evictions, 0);
    }

    #[test]
    fn test_delete_and_purge() {
        let c = cache(4, 60);
        put(&c, "a", Duration::ZERO);
        put(&c, "b", Duration::ZERO);

        assert!(c.delete("a"));
        assert!(!c.delete("a"));
        assert!(c.get("a").is_none());

        c.purge();
        assert_eq!(c.stats().entries, 0);
        assert!(c.get("b").is_none());

        // The store still works after a purge.
        put(&c, "c", Duration::ZERO);
        assert!(c.get("c").is_some());
    }

    #[test]
    fn test_slab_reuse_after_churn() {
        let c = cache(2, 60);
        for i in 0..20 {
            put(&c, &format!("k{}", i), Duration::ZERO);
        }
        let stats = c.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 18);
        assert!(c.get("k19").is_some());
        assert!(c.get("k18").is_some());
    }

    #[test]
    fn test_concurrent_mixed_operations() {
        let c = std::sync::Arc::new(cache(8, 60));
        let mut handles = Vec::new();
        for t in 0..4 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("k{}", (t * 7 + i) % 16);
                    match i % 3 {
                        0 => put(&c, &key, Duration::ZERO),
                        1 => {
                            c.get(&key);
                        }
                        _ => {
                            c.delete(&key);
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(c.stats().entries <= 8);
    }
}
