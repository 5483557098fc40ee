//! Callback aliases and result payloads delivered to subscribers.

use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use super::{CacheType, CachedImage};
use crate::domain::errors::ImageError;

/// Progress callback: `(received_bytes, expected_total)`.
///
/// `expected_total` is `-1` when the server did not announce a length.
pub type ProgressFn = Arc<dyn Fn(u64, i64) + Send + Sync>;

/// Redirect callback, consulted on every HTTP 3xx with a Location.
///
/// Returning `false` vetoes the redirect; absent a callback the redirect is
/// followed by default.
pub type RedirectFn = Arc<dyn Fn(&RedirectInfo) -> bool + Send + Sync>;

/// Completion callback for a single download subscriber.
pub type DownloadCompletionFn = Arc<dyn Fn(&DownloadOutcome) + Send + Sync>;

/// Completion callback for a single manager load request.
pub type LoadCompletionFn = Arc<dyn Fn(&LoadResult) + Send + Sync>;

/// Cancellation callback, fired exactly once when a transfer is aborted.
pub type CancelledFn = Box<dyn FnOnce() + Send + Sync>;

/// Details of an HTTP redirect about to be followed.
#[derive(Debug, Clone)]
pub struct RedirectInfo {
    /// The 3xx status code.
    pub status: u16,
    /// The URL the response came from.
    pub from: Url,
    /// The resolved target URL.
    pub to: Url,
}

/// Terminal or progressive outcome of one download, shared by all
/// subscribers coalesced onto the transfer.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// The decoded image; partial when `finished` is false.
    pub image: Option<CachedImage>,
    /// The raw encoded bytes, absent on failure.
    pub data: Option<Bytes>,
    /// The failure, if the transfer did not succeed.
    pub error: Option<ImageError>,
    /// False for progressive partial deliveries, true for the terminal one.
    pub finished: bool,
}

/// Result of one manager load request.
#[derive(Debug, Clone)]
pub struct LoadResult {
    /// The resolved image (carries its encoded bytes), absent on failure.
    pub image: Option<CachedImage>,
    /// The failure, if the request did not succeed.
    pub error: Option<ImageError>,
    /// Where the image came from; `None` means the network.
    pub cache_type: CacheType,
    /// False for preliminary deliveries (previews, progressive partials).
    pub finished: bool,
    /// The requested URL, when it parsed.
    pub url: Option<Url>,
}

impl LoadResult {
    /// Builds a terminal error result.
    #[must_use]
    pub fn failure(error: ImageError, url: Option<Url>) -> Self {
        Self {
            image: None,
            error: Some(error),
            cache_type: CacheType::None,
            finished: true,
            url,
        }
    }
}
