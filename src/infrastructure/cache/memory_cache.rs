//! In-memory image cache with LRU-by-cost eviction.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::lru::LruArena;
use crate::domain::entities::{CacheKey, CachedImage};
use crate::domain::ports::MemoryCachePort;
use crate::infrastructure::config::{CacheConfig, ConfigHandle};

/// Sleep between try-lock attempts when the trim task hits contention.
const TRIM_BACKOFF: Duration = Duration::from_millis(10);

/// Bounded in-memory key-to-image map.
///
/// Two independent limits apply, `max_memory_cost` (bytes) and
/// `max_memory_count` (entries); zero means unbounded. Any mutation that
/// exceeds a limit pops entries from the LRU tail until both are
/// satisfied, and a background task re-applies both passes every
/// `auto_trim_interval` using try-lock with backoff so foreground lookups
/// are never starved by the trimmer. Released entries are dropped on a
/// blocking worker to keep deallocation cost off the hot path.
pub struct MemoryImageCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    state: Mutex<LruArena>,
    config: watch::Receiver<CacheConfig>,
}

impl MemoryImageCache {
    /// Creates a cache subscribed to the given configuration.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime: the periodic trim task
    /// is spawned here.
    #[must_use]
    pub fn new(config: &ConfigHandle) -> Self {
        let inner = Arc::new(CacheInner {
            state: Mutex::new(LruArena::new()),
            config: config.subscribe(),
        });
        tokio::spawn(trim_loop(Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Creates a cache with default (unlimited) configuration.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(&ConfigHandle::default())
    }

    /// Re-applies both eviction passes immediately, using try-lock with
    /// backoff instead of blocking.
    pub async fn trim(&self) {
        self.inner.trim_cost().await;
        self.inner.trim_count().await;
    }

    /// Reacts to a system low-memory signal by clearing the cache.
    pub fn memory_pressure(&self) {
        debug!("memory pressure, clearing memory image cache");
        self.clear();
    }
}

impl CacheInner {
    fn limits(&self) -> (u64, u64) {
        let config = self.config.borrow();
        (config.max_memory_cost, config.max_memory_count)
    }

    fn trim_interval(&self) -> Duration {
        self.config.borrow().auto_trim_interval()
    }

    /// Pops tail entries until both limits hold; caller releases the
    /// returned images off the hot path.
    fn evict_over_limits(state: &mut LruArena, max_cost: u64, max_count: u64) -> Vec<CachedImage> {
        let mut released = Vec::new();
        while (max_cost > 0 && state.total_cost() > max_cost)
            || (max_count > 0 && state.len() as u64 > max_count)
        {
            match state.pop_tail() {
                Some((key, image)) => {
                    trace!(key = %key, "evicted memory cache entry");
                    released.push(image);
                }
                None => break,
            }
        }
        released
    }

    async fn trim_cost(&self) {
        let (max_cost, _) = self.limits();
        if max_cost == 0 {
            return;
        }
        loop {
            if let Some(mut state) = self.state.try_lock() {
                let released = Self::evict_over_limits(&mut state, max_cost, 0);
                drop(state);
                release_in_background(released);
                return;
            }
            tokio::time::sleep(TRIM_BACKOFF).await;
        }
    }

    async fn trim_count(&self) {
        let (_, max_count) = self.limits();
        if max_count == 0 {
            return;
        }
        loop {
            if let Some(mut state) = self.state.try_lock() {
                let released = Self::evict_over_limits(&mut state, 0, max_count);
                drop(state);
                release_in_background(released);
                return;
            }
            tokio::time::sleep(TRIM_BACKOFF).await;
        }
    }
}

async fn trim_loop(inner: std::sync::Weak<CacheInner>) {
    loop {
        let interval = match inner.upgrade() {
            Some(inner) => inner.trim_interval(),
            None => return,
        };
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.trim_cost().await;
        inner.trim_count().await;
    }
}

/// Drops a value on a blocking worker when a runtime is available.
fn release_in_background<T: Send + 'static>(value: T) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn_blocking(move || drop(value));
    } else {
        drop(value);
    }
}

impl MemoryCachePort for MemoryImageCache {
    fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        let found = self.inner.state.lock().get(key);
        if found.is_some() {
            trace!(key = %key, "memory cache hit");
        } else {
            trace!(key = %key, "memory cache miss");
        }
        found
    }

    fn put(&self, key: CacheKey, image: CachedImage) {
        let cost = image.memory_cost();
        self.put_with_cost(key, image, cost);
    }

    fn put_with_cost(&self, key: CacheKey, image: CachedImage, cost: u64) {
        let (max_cost, max_count) = self.inner.limits();
        let mut released = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if let Some(old) = state.insert(key, image, cost) {
                released.push(old);
            }
            released.extend(CacheInner::evict_over_limits(&mut state, max_cost, max_count));
        }
        if !released.is_empty() {
            release_in_background(released);
        }
    }

    fn remove(&self, key: &CacheKey) {
        let old = self.inner.state.lock().remove(key);
        if let Some(image) = old {
            debug!(key = %key, "removed memory cache entry");
            release_in_background(image);
        }
    }

    fn clear(&self) {
        let old = std::mem::take(&mut *self.inner.state.lock());
        release_in_background(old);
        debug!("cleared memory image cache");
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().peek(key).is_some()
    }

    fn total_cost(&self) -> u64 {
        self.inner.state.lock().total_cost()
    }

    fn total_count(&self) -> usize {
        self.inner.state.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use image::DynamicImage;

    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name)
    }

    fn img() -> CachedImage {
        CachedImage::new(Arc::new(DynamicImage::new_rgb8(1, 1)), Bytes::new(), None)
    }

    fn cache_with(config: CacheConfig) -> (MemoryImageCache, ConfigHandle) {
        let handle = ConfigHandle::new(config);
        let cache = MemoryImageCache::new(&handle);
        (cache, handle)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = MemoryImageCache::with_defaults();
        cache.put_with_cost(key("a"), img(), 10);
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("missing")).is_none());
        assert_eq!(cache.total_cost(), 10);
        assert_eq!(cache.total_count(), 1);
    }

    #[tokio::test]
    async fn unlimited_caches_never_evict() {
        let cache = MemoryImageCache::with_defaults();
        for i in 0..100 {
            cache.put_with_cost(key(&format!("k{i}")), img(), 1_000_000);
        }
        assert_eq!(cache.total_count(), 100);
    }

    #[tokio::test]
    async fn count_limit_evicts_lru_tail_prefix() {
        let (cache, _handle) = cache_with(CacheConfig {
            max_memory_count: 3,
            ..Default::default()
        });

        for name in ["a", "b", "c", "d"] {
            cache.put_with_cost(key(name), img(), 1);
        }

        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
        assert!(cache.get(&key("d")).is_some());
        assert_eq!(cache.total_count(), 3);
    }

    #[tokio::test]
    async fn cost_limit_evicts_until_under() {
        let (cache, _handle) = cache_with(CacheConfig {
            max_memory_cost: 100,
            ..Default::default()
        });

        cache.put_with_cost(key("a"), img(), 40);
        cache.put_with_cost(key("b"), img(), 40);
        cache.put_with_cost(key("c"), img(), 40);

        assert!(cache.total_cost() <= 100);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("c")).is_some());
    }

    #[tokio::test]
    async fn get_promotion_protects_from_eviction() {
        let (cache, _handle) = cache_with(CacheConfig {
            max_memory_count: 2,
            ..Default::default()
        });

        cache.put_with_cost(key("a"), img(), 1);
        cache.put_with_cost(key("b"), img(), 1);
        cache.get(&key("a"));
        cache.put_with_cost(key("c"), img(), 1);

        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
    }

    #[tokio::test]
    async fn overwrite_charges_the_cost_delta() {
        let cache = MemoryImageCache::with_defaults();
        cache.put_with_cost(key("a"), img(), 10);
        cache.put_with_cost(key("a"), img(), 30);
        assert_eq!(cache.total_cost(), 30);
        assert_eq!(cache.total_count(), 1);
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let cache = MemoryImageCache::with_defaults();
        cache.put_with_cost(key("a"), img(), 1);
        cache.put_with_cost(key("b"), img(), 1);
        cache.clear();
        assert_eq!(cache.total_count(), 0);
        assert_eq!(cache.total_cost(), 0);
        assert!(cache.get(&key("a")).is_none());
    }

    #[tokio::test]
    async fn memory_pressure_clears() {
        let cache = MemoryImageCache::with_defaults();
        cache.put_with_cost(key("a"), img(), 1);
        cache.memory_pressure();
        assert_eq!(cache.total_count(), 0);
    }

    #[tokio::test]
    async fn config_updates_apply_on_next_mutation() {
        let (cache, handle) = cache_with(CacheConfig::default());
        for i in 0..5 {
            cache.put_with_cost(key(&format!("k{i}")), img(), 1);
        }
        assert_eq!(cache.total_count(), 5);

        handle.update(|c| c.max_memory_count = 2);
        cache.put_with_cost(key("fresh"), img(), 1);
        assert_eq!(cache.total_count(), 2);
        assert!(cache.get(&key("fresh")).is_some());
    }

    #[tokio::test]
    async fn explicit_trim_applies_limits() {
        let (cache, handle) = cache_with(CacheConfig::default());
        for i in 0..5 {
            cache.put_with_cost(key(&format!("k{i}")), img(), 10);
        }
        handle.update(|c| {
            c.max_memory_cost = 25;
            c.max_memory_count = 4;
        });

        cache.trim().await;
        assert!(cache.total_cost() <= 25);
        assert!(cache.total_count() <= 4);
    }

    #[tokio::test]
    async fn contains_does_not_promote() {
        let (cache, _handle) = cache_with(CacheConfig {
            max_memory_count: 2,
            ..Default::default()
        });
        cache.put_with_cost(key("a"), img(), 1);
        cache.put_with_cost(key("b"), img(), 1);
        assert!(cache.contains(&key("a")));
        cache.put_with_cost(key("c"), img(), 1);
        assert!(!cache.contains(&key("a")));
    }
}
