//! Webimage - remote image fetching and caching for client applications.
//!
//! This crate provides the core of an image loading pipeline: a two-tier
//! cache (in-memory LRU-by-cost plus a content-addressed disk store), a
//! concurrent downloader that coalesces duplicate in-flight requests for
//! the same URL, and an orchestration manager that resolves a URL through
//! memory, disk and network in order, writing results back into both tiers.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing cache tiers, downloader, and manager.
pub mod infrastructure;

pub use domain::entities::{
    CacheKey, CacheType, CachedImage, DownloadOptions, LoadContext, LoadOptions, LoadResult,
    RedirectInfo,
};
pub use domain::errors::ImageError;
pub use domain::ports::{
    CancellableOperation, DiskCachePort, ImageCachePort, ImageDecoderPort, ImageTransformerPort,
    MemoryCachePort,
};
pub use infrastructure::{
    CacheConfig, ConfigHandle, DiskImageCache, DownloadEvent, ImageCache, ImageDownloader,
    ImageManager, MemoryImageCache,
};

/// Current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = "webimage";
