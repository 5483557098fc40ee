//! Two-tier cache facade over the memory and disk stores.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{error, trace, warn};

use crate::domain::entities::{CacheKey, CacheType, CachedImage};
use crate::domain::ports::{
    CacheHit, CancellableOperation, DiskCachePort, ImageCachePort, ImageDecoderPort,
    MemoryCachePort,
};
use crate::infrastructure::cache::{DiskImageCache, MemoryImageCache};
use crate::infrastructure::config::{CacheConfig, ConfigHandle};
use crate::infrastructure::decode::DefaultImageDecoder;

/// Completion callback for a callback-style cache query.
pub type QueryCompletionFn = Arc<dyn Fn(Option<CacheHit>) + Send + Sync>;

/// Combined memory and disk cache.
///
/// Lookups try memory first, then read through from disk: a disk hit is
/// decoded off-thread and populated into the memory tier. Both tiers are
/// plug-in points; custom stores implement the port traits and are passed
/// to [`with_stores`](Self::with_stores). Clones share the same tiers.
#[derive(Clone)]
pub struct ImageCache {
    memory: Arc<dyn MemoryCachePort>,
    disk: Arc<dyn DiskCachePort>,
    decoder: Arc<dyn ImageDecoderPort>,
    config: watch::Receiver<CacheConfig>,
}

impl ImageCache {
    /// Creates a cache with the built-in tiers rooted at
    /// `{root}/{namespace}`.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime: the tier workers are
    /// spawned here.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, namespace: &str, config: &ConfigHandle) -> Self {
        Self::with_stores(
            Arc::new(MemoryImageCache::new(config)),
            Arc::new(DiskImageCache::new(root, namespace, config)),
            Arc::new(DefaultImageDecoder),
            config,
        )
    }

    /// Creates a cache with the built-in tiers in the platform cache
    /// directory.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn with_default_location(config: &ConfigHandle) -> Self {
        Self::with_stores(
            Arc::new(MemoryImageCache::new(config)),
            Arc::new(DiskImageCache::with_default_location(config)),
            Arc::new(DefaultImageDecoder),
            config,
        )
    }

    /// Creates a cache over custom tier implementations.
    #[must_use]
    pub fn with_stores(
        memory: Arc<dyn MemoryCachePort>,
        disk: Arc<dyn DiskCachePort>,
        decoder: Arc<dyn ImageDecoderPort>,
        config: &ConfigHandle,
    ) -> Self {
        Self {
            memory,
            disk,
            decoder,
            config: config.subscribe(),
        }
    }

    /// The memory tier.
    #[must_use]
    pub fn memory(&self) -> &Arc<dyn MemoryCachePort> {
        &self.memory
    }

    /// The disk tier.
    #[must_use]
    pub fn disk(&self) -> &Arc<dyn DiskCachePort> {
        &self.disk
    }

    /// Callback-style query returning a cancellable handle.
    ///
    /// The completion fires once with the hit, or `None` on miss; a
    /// cancelled handle suppresses it. `decoder` overrides the built-in
    /// decoder for this lookup's disk read-through.
    pub fn query_image(
        &self,
        key: CacheKey,
        tiers: CacheType,
        decoder: Option<Arc<dyn ImageDecoderPort>>,
        completion: QueryCompletionFn,
    ) -> QueryHandle {
        let handle = QueryHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let cancelled = handle.cancelled.clone();
        let cache = self.clone();
        tokio::spawn(async move {
            let hit = cache.query(&key, tiers, decoder).await;
            if !cancelled.load(Ordering::Acquire) {
                completion(hit);
            }
        });
        handle
    }

    /// Runs the disk cleanup pass.
    pub async fn cleanup_disk(&self) {
        self.disk.cleanup().await;
    }

    /// Reacts to a system low-memory signal by clearing the memory tier.
    pub fn memory_pressure(&self) {
        self.memory.clear();
    }

    async fn decode_off_thread(
        &self,
        data: bytes::Bytes,
        decoder: Option<Arc<dyn ImageDecoderPort>>,
    ) -> Option<CachedImage> {
        let decoder = decoder.unwrap_or_else(|| self.decoder.clone());
        match tokio::task::spawn_blocking(move || decoder.decode(&data)).await {
            Ok(Ok(image)) => Some(image),
            Ok(Err(err)) => {
                warn!(error = %err, "failed to decode disk cache entry");
                None
            }
            Err(err) => {
                error!(error = %err, "decode task panicked");
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl ImageCachePort for ImageCache {
    async fn query(
        &self,
        key: &CacheKey,
        tiers: CacheType,
        decoder: Option<Arc<dyn ImageDecoderPort>>,
    ) -> Option<CacheHit> {
        if tiers.includes_memory() {
            if let Some(image) = self.memory.get(key) {
                return Some(CacheHit {
                    image,
                    source: CacheType::Memory,
                });
            }
        }

        if tiers.includes_disk() {
            let data = self.disk.get(key).await?;
            let image = self.decode_off_thread(data, decoder).await?;
            if self.config.borrow().cache_in_memory {
                self.memory.put(key.clone(), image.clone());
            }
            trace!(key = %key, "disk read-through");
            return Some(CacheHit {
                image,
                source: CacheType::Disk,
            });
        }

        None
    }

    async fn store(&self, key: &CacheKey, image: CachedImage, target: CacheType) {
        if target.includes_memory() && self.config.borrow().cache_in_memory {
            self.memory.put(key.clone(), image.clone());
        }
        if target.includes_disk() {
            if image.data().is_empty() {
                trace!(key = %key, "no encoded bytes, skipping disk store");
            } else if let Err(err) = self.disk.put(key, image.data().clone()).await {
                warn!(key = %key, error = %err, "failed to store image on disk");
            }
        }
    }

    async fn remove(&self, key: &CacheKey, target: CacheType) {
        if target.includes_memory() {
            self.memory.remove(key);
        }
        if target.includes_disk() {
            self.disk.remove(key).await;
        }
    }

    async fn clear(&self, target: CacheType) {
        if target.includes_memory() {
            self.memory.clear();
        }
        if target.includes_disk() {
            self.disk.clear().await;
        }
    }

    async fn contains(&self, key: &CacheKey, tier: CacheType) -> bool {
        match tier {
            CacheType::Memory => self.memory.contains(key),
            CacheType::Disk => self.disk.contains(key).await,
            CacheType::Both => self.memory.contains(key) || self.disk.contains(key).await,
            CacheType::None => false,
        }
    }
}

/// Cancellable handle for a callback-style cache query.
pub struct QueryHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellableOperation for QueryHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
