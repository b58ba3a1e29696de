//! Variable pricing: dollars-to-cents normalization and tag resolution.
//!
//! A tag is a symbolic name priced out of the `tags` table. Resolved
//! amounts are memoized in a never-expiring cache, so each distinct tag
//! costs at most one store round trip for the life of the process.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cache::{CacheOptions, Clock, SystemClock, TtlCache};
use crate::store::{StoreError, TagStore};

const TAG_CACHE_CAPACITY: usize = 10_000;

/// Converts a major-unit amount (dollars) to integer minor units (cents).
/// This is `floor(amount * 100)`, not rounding: sub-cent fractions are
/// dropped and the scaled value floors toward negative infinity.
pub fn dollars_to_cents(amount: f64) -> i64 {
    (amount * 100.0).floor() as i64
}

pub struct TagResolver {
    store: Arc<dyn TagStore>,
    cache: Mutex<TtlCache<String, i64>>,
    clock: Box<dyn Clock>,
}

impl TagResolver {
    pub fn new(store: Arc<dyn TagStore>) -> Self {
        Self::with_clock(store, Box::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn TagStore>, clock: Box<dyn Clock>) -> Self {
        Self {
            store,
            cache: Mutex::new(TtlCache::new(CacheOptions {
                max_entries: TAG_CACHE_CAPACITY,
                ttl: None,
            })),
            clock,
        }
    }

    /// `Ok(None)` means the tag does not exist, which callers surface as a
    /// validation failure; `Err` is a store-level failure and stays an
    /// internal condition.
    pub async fn resolve(&self, tag: &str) -> Result<Option<i64>, StoreError> {
        let now_ms = self.clock.now_epoch_millis();
        let key = tag.to_string();
        if let Some(cents) = self.cache.lock().await.get(&key, now_ms) {
            return Ok(Some(cents));
        }
        let amount = self.store.tag_amount(tag).await?;
        if let Some(cents) = amount {
            self.cache.lock().await.insert(key, cents, now_ms);
        }
        Ok(amount)
    }
}
