//! TTL query cache with explicit invalidation

use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Cache entry with expiration
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub timestamp: Instant,
    pub ttl: Duration,
    /// Marked by invalidation; served by `peek` but never by `get`.
    pub stale: bool,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self) -> bool {
        self.timestamp.elapsed() > self.ttl
    }

    pub fn is_fresh(&self) -> bool {
        !self.stale && !self.is_expired()
    }
}

/// Issued when a fetch starts; presented again when it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket<K> {
    key: K,
    generation: u64,
}

impl<K> FetchTicket<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub stale_entries: usize,
    pub expired_entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn merge(self, other: CacheStats) -> CacheStats {
        CacheStats {
            entries: self.entries + other.entries,
            stale_entries: self.stale_entries + other.stale_entries,
            expired_entries: self.expired_entries + other.expired_entries,
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
        }
    }
}

/// Keyed cache where every key carries a generation. Invalidating a key moves
/// it to a new generation, so a fetch that started before the invalidation is
/// stored stale instead of resurrecting old data.
///
/// A key keeps its generation only while it has an entry or a fetch in flight.
pub struct TtlCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    generations: HashMap<K, u64>,
    in_flight: HashMap<K, usize>,
    next_generation: u64,
    default_ttl: Duration,
    hits: u64,
    misses: u64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            generations: HashMap::new(),
            in_flight: HashMap::new(),
            next_generation: 0,
            default_ttl,
            hits: 0,
            misses: 0,
        }
    }

    fn bump(&mut self, key: &K) {
        self.next_generation += 1;
        self.generations.insert(key.clone(), self.next_generation);
    }

    /// Fresh value for `key`, if any.
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get(key).filter(|e| e.is_fresh()) {
            Some(entry) => {
                self.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Whatever is stored for `key`, fresh or not.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn is_fresh(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|e| e.is_fresh())
    }

    pub fn begin(&mut self, key: K) -> FetchTicket<K> {
        let generation = match self.generations.get(&key) {
            Some(generation) => *generation,
            None => {
                self.bump(&key);
                self.next_generation
            }
        };
        *self.in_flight.entry(key.clone()).or_insert(0) += 1;
        FetchTicket { key, generation }
    }

    fn settle(&mut self, key: &K) {
        if let Some(count) = self.in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(key);
            }
        }
    }

    fn prune_generation(&mut self, key: &K) {
        if !self.entries.contains_key(key) && !self.in_flight.contains_key(key) {
            self.generations.remove(key);
        }
    }

    /// A fetch that produced no value.
    pub fn abandon(&mut self, ticket: FetchTicket<K>) {
        self.settle(&ticket.key);
        self.prune_generation(&ticket.key);
    }

    /// Store a fetch result. Returns whether it was stored fresh.
    ///
    /// Results for keys discarded since `begin` are dropped; results for keys
    /// invalidated since `begin` are stored stale.
    pub fn complete(&mut self, ticket: FetchTicket<K>, value: V) -> bool {
        self.settle(&ticket.key);
        let Some(current) = self.generations.get(&ticket.key).copied() else {
            return false;
        };
        let stale = current != ticket.generation;
        if stale && self.is_fresh(&ticket.key) {
            return false;
        }
        self.entries.insert(
            ticket.key,
            CacheEntry {
                value,
                timestamp: Instant::now(),
                ttl: self.default_ttl,
                stale,
            },
        );
        !stale
    }

    /// Store a value directly as fresh.
    pub fn insert(&mut self, key: K, value: V) {
        let ticket = self.begin(key);
        self.complete(ticket, value);
    }

    /// Mark every entry and in-flight fetch matching `predicate` stale.
    /// Returns how many stored entries were affected.
    pub fn invalidate_where(&mut self, predicate: impl Fn(&K) -> bool) -> usize {
        let keys: Vec<K> = self.generations.keys().filter(|k| predicate(k)).cloned().collect();
        let mut affected = 0;
        for key in &keys {
            self.bump(key);
            if let Some(entry) = self.entries.get_mut(key) {
                entry.stale = true;
                affected += 1;
            }
        }
        affected
    }

    pub fn invalidate(&mut self, key: &K) -> bool {
        self.invalidate_where(|k| k == key) > 0
    }

    /// Drop entries matching `predicate`; in-flight fetches for them are discarded on completion.
    pub fn remove_where(&mut self, predicate: impl Fn(&K) -> bool) -> usize {
        self.generations.retain(|k, _| !predicate(k));
        self.in_flight.retain(|k, _| !predicate(k));
        let before = self.entries.len();
        self.entries.retain(|k, _| !predicate(k));
        before - self.entries.len()
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        self.entries.clear();
        self.generations.clear();
        self.in_flight.clear();
    }

    /// Clear expired entries, and the generations of keys left with nothing in flight.
    pub fn cleanup_expired(&mut self) -> usize {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
            self.prune_generation(key);
        }
        expired.len()
    }

    /// Keys that still carry a generation.
    pub fn tracked_keys(&self) -> usize {
        self.generations.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            stale_entries: self.entries.values().filter(|e| e.stale).count(),
            expired_entries: self.entries.values().filter(|e| e.is_expired()).count(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}
