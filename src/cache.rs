//! Bounded TTL cache with lazy expiry.
//!
//! Entries expire in place: nothing sweeps the map in the background, a
//! stale entry is evicted by the `get` that observes it. Callers pass the
//! current time in, which keeps TTL behavior testable without sleeping.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
    pub max_entries: usize,
    /// `None` means entries never expire by age (the tag cache behaves as a
    /// long-lived memoization table).
    pub ttl: Option<Duration>,
}

/// Re-checked on every hit; an entry that fails it is evicted and treated
/// as a miss. Receives the current epoch-milliseconds alongside the value.
type ValidityPredicate<V> = Box<dyn Fn(&V, u64) -> bool + Send + Sync>;

pub struct TtlCache<K, V> {
    options: CacheOptions,
    validity: Option<ValidityPredicate<V>>,
    entries: HashMap<K, Entry<V>>,
    // Front is the oldest key; `get` refreshes a hit to the back.
    order: VecDeque<K>,
}

struct Entry<V> {
    value: V,
    inserted_at_ms: u64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options,
            validity: None,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn with_validity(
        mut self,
        predicate: impl Fn(&V, u64) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.validity = Some(Box::new(predicate));
        self
    }

    pub fn get(&mut self, key: &K, now_ms: u64) -> Option<V> {
        let entry = self.entries.get(key)?;
        let fresh = match self.options.ttl {
            Some(ttl) => entry.inserted_at_ms.saturating_add(ttl.as_millis() as u64) > now_ms,
            None => true,
        };
        let valid = self
            .validity
            .as_ref()
            .map(|predicate| predicate(&entry.value, now_ms))
            .unwrap_or(true);
        if !fresh || !valid {
            self.remove(key);
            return None;
        }
        let value = entry.value.clone();
        self.touch(key);
        Some(value)
    }

    pub fn insert(&mut self, key: K, value: V, now_ms: u64) {
        if self.entries.contains_key(&key) {
            self.touch(&key);
        } else {
            if self.entries.len() >= self.options.max_entries {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
            self.order.push_back(key.clone());
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at_ms: now_ms,
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|candidate| candidate != key);
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: &K) {
        self.order.retain(|candidate| candidate != key);
        self.order.push_back(key.clone());
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0)
    }
}
