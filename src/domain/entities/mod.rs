//! Domain entity definitions.

mod cache_key;
mod cache_type;
mod cached_image;
mod callbacks;
mod context;
mod options;

pub use cache_key::CacheKey;
pub use cache_type::CacheType;
pub use cached_image::CachedImage;
pub use callbacks::{
    CancelledFn, DownloadCompletionFn, DownloadOutcome, LoadCompletionFn, LoadResult, ProgressFn,
    RedirectFn, RedirectInfo,
};
pub use context::{CacheKeyFilterFn, LoadContext};
pub use options::{DownloadOptions, LoadOptions};
