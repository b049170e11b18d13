//! Fingerprint-keyed response cache
//!
//! Striped locking: sixteen shards, each guarding its own map, so reads of
//! settled entries never contend with writes on other keys. Single-flight is
//! a per-key latch: the first caller becomes the producer, every concurrent
//! caller for the same key waits on a watch channel and receives the same
//! result. In-flight keys are never evicted; TTL expiry is lazy on read.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::domain_types::{CacheMaxBytes, CacheMaxEntries, CacheTtlMs, EndpointName};
use crate::error::RouteError;

const SHARD_COUNT: usize = 16;
/// Fixed accounting overhead per entry, on top of the payload bytes
const ENTRY_OVERHEAD_BYTES: u64 = 64;

/// Token accounting reported by an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,
    /// Tokens in the completion
    pub completion_tokens: u32,
    /// Total billed tokens
    pub total_tokens: u32,
}

/// A successfully produced response, as cached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// The endpoint's raw response text
    pub response: String,
    /// Which endpoint produced it
    pub endpoint_used: EndpointName,
    /// When production completed
    pub completed_at: DateTime<Utc>,
    /// Reported token usage
    pub token_usage: TokenUsage,
}

impl CachedResponse {
    fn byte_size(&self, key: &str) -> u64 {
        self.response.len() as u64 + key.len() as u64 + ENTRY_OVERHEAD_BYTES
    }
}

/// Counters exposed through the status surface
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Settled entries currently cached
    pub entries: usize,
    /// Approximate bytes held
    pub bytes: u64,
    /// Reads served from a settled entry
    pub hits: u64,
    /// Reads that found nothing usable
    pub misses: u64,
    /// Callers coalesced onto another caller's in-flight production
    pub coalesced: u64,
    /// Entries evicted by the LRU policy
    pub evictions: u64,
    /// Keys with a producer currently running
    pub inflight: usize,
}

#[derive(Clone)]
enum FlightState {
    Pending,
    Done(Result<CachedResponse, RouteError>),
}

struct ReadyEntry {
    value: CachedResponse,
    expires_at: Instant,
    last_access: u64,
    bytes: u64,
}

enum Slot {
    Ready(ReadyEntry),
    Inflight(watch::Receiver<FlightState>),
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, Slot>,
    bytes: u64,
}

impl Shard {
    fn ready_count(&self) -> usize {
        self.entries
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }
}

/// Striped, single-flight, TTL + LRU response cache
pub struct ResponseCache {
    shards: Vec<Mutex<Shard>>,
    default_ttl: Duration,
    max_entries_per_shard: usize,
    max_bytes_per_shard: u64,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Creates a cache with the given TTL and caps
    #[must_use]
    pub fn new(ttl: CacheTtlMs, max_entries: CacheMaxEntries, max_bytes: CacheMaxBytes) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect();
        Self {
            shards,
            default_ttl: ttl.as_duration(),
            max_entries_per_shard: (max_entries.as_usize() / SHARD_COUNT).max(1),
            max_bytes_per_shard: (max_bytes.as_u64() / SHARD_COUNT as u64).max(1024),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for byte in key.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        #[allow(clippy::cast_possible_truncation)]
        let index = (hash % SHARD_COUNT as u64) as usize;
        &self.shards[index]
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Fetches a settled, unexpired entry
    ///
    /// Expired entries are removed lazily here; in-flight productions are
    /// reported as misses because no value exists yet.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let tick = self.next_tick();
        let mut shard = self.shard_for(key).lock().expect("cache shard poisoned");
        match shard.entries.get_mut(key) {
            Some(Slot::Ready(entry)) => {
                if entry.expires_at <= Instant::now() {
                    let bytes = entry.bytes;
                    shard.entries.remove(key);
                    shard.bytes = shard.bytes.saturating_sub(bytes);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    trace!(key, "cache entry expired");
                    None
                } else {
                    entry.last_access = tick;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(entry.value.clone())
                }
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts a settled value under the default TTL
    pub fn put(&self, key: &str, value: CachedResponse) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    /// Inserts a settled value with an explicit TTL
    ///
    /// Overwrites a settled entry for the key; an in-flight production is
    /// left alone and will settle on its own.
    pub fn put_with_ttl(&self, key: &str, value: CachedResponse, ttl: Duration) {
        let tick = self.next_tick();
        let mut shard = self.shard_for(key).lock().expect("cache shard poisoned");
        if matches!(shard.entries.get(key), Some(Slot::Inflight(_))) {
            return;
        }
        self.install(&mut shard, key, value, ttl, tick);
    }

    /// Drops a settled entry; in-flight productions are untouched
    pub fn invalidate(&self, key: &str) {
        let mut shard = self.shard_for(key).lock().expect("cache shard poisoned");
        if matches!(shard.entries.get(key), Some(Slot::Ready(_)))
            && let Some(Slot::Ready(entry)) = shard.entries.remove(key)
        {
            shard.bytes = shard.bytes.saturating_sub(entry.bytes);
        }
    }

    /// Single-flight read-through
    ///
    /// At most one producer runs per key; every concurrent caller receives a
    /// clone of the same result. A failed or cancelled producer settles all
    /// waiters with the same error and caches nothing.
    ///
    /// # Errors
    /// Returns the producer's error, `RouteError::Cancelled` when the
    /// producer was dropped before settling.
    pub async fn get_or_compute<F>(
        &self,
        key: &str,
        producer: F,
    ) -> Result<CachedResponse, RouteError>
    where
        F: Future<Output = Result<CachedResponse, RouteError>>,
    {
        enum Role {
            Hit(CachedResponse),
            Follower(watch::Receiver<FlightState>),
            Leader(watch::Sender<FlightState>),
        }

        let role = {
            let tick = self.next_tick();
            let mut shard = self.shard_for(key).lock().expect("cache shard poisoned");
            match shard.entries.get_mut(key) {
                Some(Slot::Ready(entry)) if entry.expires_at > Instant::now() => {
                    entry.last_access = tick;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Role::Hit(entry.value.clone())
                }
                Some(Slot::Inflight(rx)) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    Role::Follower(rx.clone())
                }
                _ => {
                    // Expired or absent: this caller becomes the producer.
                    if let Some(Slot::Ready(old)) = shard.entries.remove(key) {
                        shard.bytes = shard.bytes.saturating_sub(old.bytes);
                    }
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(FlightState::Pending);
                    shard.entries.insert(key.to_string(), Slot::Inflight(rx));
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Hit(value) => Ok(value),
            Role::Follower(mut rx) => loop {
                if let FlightState::Done(result) = rx.borrow().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    // The leader was dropped before settling.
                    return Err(RouteError::Cancelled);
                }
            },
            Role::Leader(tx) => {
                let result = producer.await;
                let tick = self.next_tick();
                {
                    let mut shard =
                        self.shard_for(key).lock().expect("cache shard poisoned");
                    shard.entries.remove(key);
                    if let Ok(value) = &result {
                        self.install(&mut shard, key, value.clone(), self.default_ttl, tick);
                    }
                }
                let _ = tx.send(FlightState::Done(result.clone()));
                result
            }
        }
    }

    fn install(
        &self,
        shard: &mut Shard,
        key: &str,
        value: CachedResponse,
        ttl: Duration,
        tick: u64,
    ) {
        if let Some(Slot::Ready(old)) = shard.entries.remove(key) {
            shard.bytes = shard.bytes.saturating_sub(old.bytes);
        }
        let bytes = value.byte_size(key);
        shard.bytes += bytes;
        shard.entries.insert(
            key.to_string(),
            Slot::Ready(ReadyEntry {
                value,
                expires_at: Instant::now() + ttl,
                last_access: tick,
                bytes,
            }),
        );
        self.evict_over_cap(shard);
    }

    /// Evicts least-recently-used settled entries until under the caps.
    /// In-flight slots are never candidates.
    fn evict_over_cap(&self, shard: &mut Shard) {
        while shard.ready_count() > self.max_entries_per_shard
            || shard.bytes > self.max_bytes_per_shard
        {
            let victim = shard
                .entries
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) => Some((key.clone(), entry.last_access)),
                    Slot::Inflight(_) => None,
                })
                .min_by_key(|(_, last_access)| *last_access);
            let Some((victim_key, _)) = victim else { break };
            if let Some(Slot::Ready(entry)) = shard.entries.remove(&victim_key) {
                shard.bytes = shard.bytes.saturating_sub(entry.bytes);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = victim_key, "cache entry evicted");
            }
        }
    }

    /// Aggregate counters across shards
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut entries = 0usize;
        let mut bytes = 0u64;
        let mut inflight = 0usize;
        for shard in &self.shards {
            let shard = shard.lock().expect("cache shard poisoned");
            bytes += shard.bytes;
            for slot in shard.entries.values() {
                match slot {
                    Slot::Ready(_) => entries += 1,
                    Slot::Inflight(_) => inflight += 1,
                }
            }
        }
        CacheStats {
            entries,
            bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            inflight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::EndpointName;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    fn cache() -> ResponseCache {
        ResponseCache::new(
            CacheTtlMs::try_new(60_000).unwrap(),
            CacheMaxEntries::try_new(256).unwrap(),
            CacheMaxBytes::try_new(1_048_576).unwrap(),
        )
    }

    fn response(text: &str) -> CachedResponse {
        CachedResponse {
            response: text.to_string(),
            endpoint_used: EndpointName::try_new("local".to_string()).unwrap(),
            completed_at: Utc::now(),
            token_usage: TokenUsage::default(),
        }
    }

    #[test]
    fn test_put_then_get_within_ttl() {
        let cache = cache();
        cache.put("k1", response("hello"));
        let got = cache.get("k1").unwrap();
        assert_eq!(got.response, "hello");
    }

    #[test]
    fn test_expired_entry_is_a_lazy_miss() {
        let cache = cache();
        cache.put_with_ttl("k1", response("hello"), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("k1").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = cache();
        cache.put("k1", response("hello"));
        cache.invalidate("k1");
        assert!(cache.get("k1").is_none());
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_producers() {
        let cache = Arc::new(cache());
        let produced = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let produced = Arc::clone(&produced);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("shared", async move {
                        produced.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(response("computed"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value.response, "computed");
        }
        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_failed_producer_settles_all_waiters_and_caches_nothing() {
        let cache = Arc::new(cache());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("failing", async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(RouteError::Cancelled)
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(RouteError::Cancelled)));
        }
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_lru_eviction_under_entry_cap() {
        // One entry per shard: inserting two keys in the same shard evicts
        // the older one.
        let cache = ResponseCache::new(
            CacheTtlMs::try_new(60_000).unwrap(),
            CacheMaxEntries::try_new(16).unwrap(),
            CacheMaxBytes::try_new(1_048_576).unwrap(),
        );
        let mut keys = Vec::new();
        // Find three keys landing in one shard by probing.
        let mut i = 0;
        while keys.len() < 3 {
            let key = format!("key-{i}");
            if std::ptr::eq(cache.shard_for(&key), cache.shard_for("key-0")) {
                keys.push(key);
            }
            i += 1;
        }
        cache.put(&keys[0], response("a"));
        cache.put(&keys[1], response("b"));
        let _ = cache.get(&keys[1]);
        cache.put(&keys[2], response("c"));
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn test_byte_cap_enforced() {
        let cache = ResponseCache::new(
            CacheTtlMs::try_new(60_000).unwrap(),
            CacheMaxEntries::try_new(1024).unwrap(),
            CacheMaxBytes::try_new(65_536).unwrap(),
        );
        for i in 0..64 {
            cache.put(&format!("k{i}"), response(&"x".repeat(4096)));
        }
        let stats = cache.stats();
        assert!(stats.bytes <= 65_536, "bytes {}", stats.bytes);
        assert!(stats.evictions > 0);
    }
}
