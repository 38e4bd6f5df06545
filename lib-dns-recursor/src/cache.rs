use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dns_wire::types::*;

use crate::config::CacheConfig;

/// A convenience wrapper around a `Cache` which lets it be shared
/// between tasks.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying `Cache` object.  Each operation
/// takes the lock for its whole duration, so a `get` observes a prior
/// `put` in full or not at all.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
}

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

impl SharedCache {
    /// Make a new, empty, shared cache with the default bounds.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a new cache with the given bounds.
    pub fn with_config(config: CacheConfig) -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(Cache::with_config(config))),
        }
    }

    /// Get the records for a question, if a live entry exists.  The
    /// TTLs in the returned records are relative to the current time,
    /// not to when the entry was inserted.
    pub fn get(&self, name: &DomainName, qtype: &QueryType) -> Option<Vec<ResourceRecord>> {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).get(name, qtype)
    }

    /// Insert an answer under its question.
    pub fn put(&self, name: &DomainName, qtype: &QueryType, records: &[ResourceRecord]) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .put(name, qtype, records);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).clear();
    }

    /// Drop expired entries.  Returns how many entries were removed.
    ///
    /// Expiry is otherwise lazy (entries are checked as they are
    /// touched), so a periodic sweep keeps idle entries from sitting
    /// around until eviction.
    pub fn prune(&self) -> usize {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .remove_expired()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).stats()
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of the cache counters and size.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub approximate_weight: usize,
}

type CacheKey = (DomainName, QueryType);

/// Caching for whole answers, keyed by question.
///
/// You probably want to use `SharedCache` instead.
#[derive(Debug, Clone)]
pub struct Cache {
    config: CacheConfig,

    /// The entries.  Names are lowercased at construction, so lookup
    /// is case-insensitive by the time it gets here.
    entries: HashMap<CacheKey, CacheEntry>,

    /// Priority queue of keys ordered by access time.  When the cache
    /// is over one of its bounds and nothing has expired, keys are
    /// evicted in LRU order.
    ///
    /// INVARIANT: the keys in here are exactly the keys in `entries`.
    access_priority: PriorityQueue<CacheKey, Reverse<Instant>>,

    /// Priority queue of keys ordered by expiry time, soonest first.
    ///
    /// INVARIANT: the keys in here are exactly the keys in `entries`.
    expiry_priority: PriorityQueue<CacheKey, Reverse<Instant>>,

    /// INVARIANT: the sum of the `weight` fields of the entries.
    current_weight: usize,

    hits: u64,
    misses: u64,
    evictions: u64,
}

/// One cached answer.
#[derive(Debug, Clone, Eq, PartialEq)]
struct CacheEntry {
    records: Vec<ResourceRecord>,

    inserted_at: Instant,

    /// `inserted_at` plus the minimum TTL across `records`.
    expires_at: Instant,

    /// Approximate size of the key and records, in octets.
    weight: usize,
}

impl Cache {
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            access_priority: PriorityQueue::new(),
            expiry_priority: PriorityQueue::new(),
            current_weight: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Get the records for a question iff the entry exists and has
    /// not expired.  An expired entry is removed on contact, so a
    /// stale answer is never observable.
    pub fn get(&mut self, name: &DomainName, qtype: &QueryType) -> Option<Vec<ResourceRecord>> {
        let key = (name.clone(), *qtype);
        let now = Instant::now();

        if !self.entries.contains_key(&key) {
            self.misses += 1;
            return None;
        }

        if self.entries[&key].expires_at <= now {
            self.remove(&key);
            self.misses += 1;
            return None;
        }

        let entry = &self.entries[&key];
        let elapsed =
            u32::try_from(now.saturating_duration_since(entry.inserted_at).as_secs())
                .unwrap_or(u32::MAX);
        let records = entry
            .records
            .iter()
            .map(|rr| {
                let mut rr = rr.clone();
                rr.ttl = rr.ttl.saturating_sub(elapsed);
                rr
            })
            .collect();

        self.access_priority.change_priority(&key, Reverse(now));
        self.hits += 1;
        Some(records)
    }

    /// Insert an answer.  Empty answers, and answers whose minimum
    /// TTL is below the configured floor, are not stored.  Expired
    /// and then least-recently-used entries are evicted until the new
    /// entry fits within both the entry-count and the weight bound.
    pub fn put(&mut self, name: &DomainName, qtype: &QueryType, records: &[ResourceRecord]) {
        let Some(min_ttl) = records.iter().map(|rr| rr.ttl).min() else {
            return;
        };
        if min_ttl < self.config.min_ttl {
            return;
        }

        let weight = approximate_weight(name, records);
        if weight > self.config.max_memory_bytes || self.config.max_entries == 0 {
            // it can never fit
            return;
        }

        let key = (name.clone(), *qtype);
        self.remove(&key);
        self.remove_expired();
        while !self.entries.is_empty()
            && (self.entries.len() + 1 > self.config.max_entries
                || self.current_weight + weight > self.config.max_memory_bytes)
        {
            self.remove_least_recently_used();
        }

        let now = Instant::now();
        let expires_at = now + Duration::from_secs(min_ttl.into());
        self.current_weight += weight;
        self.access_priority.push(key.clone(), Reverse(now));
        self.expiry_priority.push(key.clone(), Reverse(expires_at));
        self.entries.insert(
            key,
            CacheEntry {
                records: records.to_vec(),
                inserted_at: now,
                expires_at,
                weight,
            },
        );
    }

    /// Drop every entry.  The counters carry over.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.access_priority.clear();
        self.expiry_priority.clear();
        self.current_weight = 0;
    }

    /// Delete all expired entries.  Returns the number deleted.
    pub fn remove_expired(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        while let Some((key, Reverse(expires_at))) = self.expiry_priority.pop() {
            if expires_at > now {
                self.expiry_priority.push(key, Reverse(expires_at));
                break;
            }

            if let Some(entry) = self.entries.remove(&key) {
                self.current_weight -= entry.weight;
            }
            self.access_priority.remove(&key);
            removed += 1;
        }

        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.entries.len(),
            approximate_weight: self.current_weight,
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.current_weight -= entry.weight;
            self.access_priority.remove(key);
            self.expiry_priority.remove(key);
        }
    }

    fn remove_least_recently_used(&mut self) {
        if let Some((key, _)) = self.access_priority.pop() {
            self.expiry_priority.remove(&key);
            if let Some(entry) = self.entries.remove(&key) {
                self.current_weight -= entry.weight;
            }
            self.evictions += 1;
        }
    }
}

/// Approximate the memory footprint of an entry, in octets.  The
/// estimate only has to be monotone in the real memory use.
fn approximate_weight(name: &DomainName, records: &[ResourceRecord]) -> usize {
    let mut weight = name.octets.len() + 4;
    for rr in records {
        weight += rr.name.octets.len() + 10 + rr.data.rdata_len();
    }
    weight
}
