//! Per-request option masks.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Options controlling a single [`load_image`] request.
    ///
    /// Each bit is independent; download-related bits are mapped one-to-one
    /// onto [`DownloadOptions`] when a network fetch is needed.
    ///
    /// [`load_image`]: crate::infrastructure::ImageManager::load_image
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct LoadOptions: u32 {
        /// Ignore the failed-URL blacklist and try again.
        const RETRY_FAILED = 1 << 0;
        /// Queue the fetch at the back of the download queue.
        const LOW_PRIORITY = 1 << 1;
        /// Do not persist the downloaded image to disk.
        const CACHE_MEMORY_ONLY = 1 << 2;
        /// Deliver partial decoded images while the download progresses.
        const PROGRESSIVE_LOAD = 1 << 3;
        /// Deliver the cached result as a preview, then fetch anyway.
        const REFRESH_CACHED = 1 << 4;
        /// Ask the embedder for an OS background-task wrapper (advisory).
        const CONTINUE_IN_BACKGROUND = 1 << 5;
        /// Allow cookies on the HTTP request.
        const HANDLE_COOKIES = 1 << 6;
        /// Skip TLS certificate validation (diagnostic only).
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 7;
        /// Queue the fetch at the front of the download queue.
        const HIGH_PRIORITY = 1 << 8;
        /// The caller takes over installing the image into its target.
        const AVOID_AUTO_SET_IMAGE = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Options controlling a single download, derived from [`LoadOptions`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DownloadOptions: u32 {
        /// Queue at the back of the download queue.
        const LOW_PRIORITY = 1 << 0;
        /// Deliver partial decoded images while the download progresses.
        const PROGRESSIVE_LOAD = 1 << 1;
        /// Ask the embedder for an OS background-task wrapper (advisory).
        const CONTINUE_IN_BACKGROUND = 1 << 2;
        /// Allow cookies on the HTTP request.
        const HANDLE_COOKIES = 1 << 3;
        /// Skip TLS certificate validation (diagnostic only).
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 4;
        /// Queue at the front of the download queue.
        const HIGH_PRIORITY = 1 << 5;
    }
}

impl From<LoadOptions> for DownloadOptions {
    fn from(options: LoadOptions) -> Self {
        let mut mapped = Self::empty();
        if options.contains(LoadOptions::LOW_PRIORITY) {
            mapped |= Self::LOW_PRIORITY;
        }
        if options.contains(LoadOptions::PROGRESSIVE_LOAD) {
            mapped |= Self::PROGRESSIVE_LOAD;
        }
        if options.contains(LoadOptions::CONTINUE_IN_BACKGROUND) {
            mapped |= Self::CONTINUE_IN_BACKGROUND;
        }
        if options.contains(LoadOptions::HANDLE_COOKIES) {
            mapped |= Self::HANDLE_COOKIES;
        }
        if options.contains(LoadOptions::ALLOW_INVALID_SSL_CERTIFICATES) {
            mapped |= Self::ALLOW_INVALID_SSL_CERTIFICATES;
        }
        if options.contains(LoadOptions::HIGH_PRIORITY) {
            mapped |= Self::HIGH_PRIORITY;
        }
        mapped
    }
}
