//! Cache tiers and the two-tier facade.

mod disk_cache;
mod image_cache;
mod lru;
mod memory_cache;

pub use disk_cache::{DEFAULT_NAMESPACE, DiskImageCache};
pub use image_cache::{ImageCache, QueryCompletionFn, QueryHandle};
pub use memory_cache::MemoryImageCache;
