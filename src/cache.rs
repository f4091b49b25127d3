//! A small TTL cache used for reusing leased sessions.
//!
//! Not internally synchronized; owners wrap it in the lock that fits their
//! access pattern. Uses `tokio::time::Instant` so paused-time tests can
//! advance past the TTL.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the value if it was inserted less than `ttl` ago.
    pub fn get_fresh(&self, key: &K) -> Option<V> {
        self.entries
            .get(key)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    pub fn age(&self, key: &K) -> Option<Duration> {
        self.entries.get(key).map(|e| e.inserted_at.elapsed())
    }

    /// Insert a value, returning whatever it replaced (fresh or not).
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.entries
            .insert(
                key,
                Entry {
                    value,
                    inserted_at: Instant::now(),
                },
            )
            .map(|e| e.value)
    }

    pub fn invalidate(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Remove and return every entry older than `ttl`.
    pub fn take_expired(&mut self) -> Vec<(K, V)> {
        let ttl = self.ttl;
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e.value)))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.entries.drain().map(|(k, e)| (k, e.value)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
