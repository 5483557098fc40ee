//! Cache tier capability traits.

use std::sync::Arc;

use bytes::Bytes;

use super::ImageDecoderPort;
use crate::domain::entities::{CacheKey, CacheType, CachedImage};
use crate::domain::errors::ImageError;

/// A successful two-tier cache lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The resolved image.
    pub image: CachedImage,
    /// The tier the image was found in.
    pub source: CacheType,
}

/// Capability of the in-memory tier.
///
/// Operations are O(1) under a short-held lock, so the trait is synchronous.
/// Implementations must be thread-safe.
pub trait MemoryCachePort: Send + Sync {
    /// Returns the image for a key, promoting it to most-recently-used.
    fn get(&self, key: &CacheKey) -> Option<CachedImage>;

    /// Inserts or overwrites an entry, charging `image.memory_cost()`.
    fn put(&self, key: CacheKey, image: CachedImage);

    /// Inserts or overwrites an entry with an explicit cost.
    fn put_with_cost(&self, key: CacheKey, image: CachedImage, cost: u64);

    /// Removes an entry; no-op when absent.
    fn remove(&self, key: &CacheKey);

    /// Removes all entries.
    fn clear(&self);

    /// Returns true without promoting the entry.
    fn contains(&self, key: &CacheKey) -> bool;

    /// Sum of resident entry costs.
    fn total_cost(&self) -> u64;

    /// Number of resident entries.
    fn total_count(&self) -> usize;
}

/// Capability of the on-disk tier.
///
/// Implementations must serialize mutations so that write ordering per key
/// is preserved. Read failures are reported as misses, never as errors.
#[async_trait::async_trait]
pub trait DiskCachePort: Send + Sync {
    /// Returns the stored bytes for a key, or `None` on miss or I/O error.
    async fn get(&self, key: &CacheKey) -> Option<Bytes>;

    /// Stores bytes under a key.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written.
    async fn put(&self, key: &CacheKey, data: Bytes) -> Result<(), ImageError>;

    /// Deletes the file for a key; ignores "not found".
    async fn remove(&self, key: &CacheKey);

    /// Deletes the namespace directory and recreates it empty.
    async fn clear(&self);

    /// Applies the age and size caps, deleting expired and excess files.
    async fn cleanup(&self);

    /// Returns true when a file exists for the key.
    async fn contains(&self, key: &CacheKey) -> bool;

    /// Total bytes currently stored in the namespace.
    async fn total_size(&self) -> u64;

    /// Number of files currently stored in the namespace.
    async fn entry_count(&self) -> usize;
}

/// Capability of the combined two-tier cache consumed by the manager.
///
/// This is the plug-in point for custom cache replacements: the manager is
/// polymorphic over this trait and never touches the tiers directly.
#[async_trait::async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Looks a key up in the addressed tiers, memory first.
    ///
    /// A disk hit is decoded and populated into the memory tier. `decoder`
    /// overrides the built-in decoder for this lookup's read-through.
    async fn query(
        &self,
        key: &CacheKey,
        tiers: CacheType,
        decoder: Option<Arc<dyn ImageDecoderPort>>,
    ) -> Option<CacheHit>;

    /// Writes an image into the addressed tiers. `None` target is a no-op.
    async fn store(&self, key: &CacheKey, image: CachedImage, target: CacheType);

    /// Removes a key from the addressed tiers.
    async fn remove(&self, key: &CacheKey, target: CacheType);

    /// Clears the addressed tiers.
    async fn clear(&self, target: CacheType);

    /// Reports presence in one tier without promoting or decoding.
    async fn contains(&self, key: &CacheKey, tier: CacheType) -> bool;
}
