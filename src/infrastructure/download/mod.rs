//! HTTP fetching with bounded concurrency and request coalescing.

mod downloader;
mod fetcher;
#[cfg(test)]
pub(crate) mod test_server;

pub use downloader::{
    DEFAULT_MAX_CONCURRENT, DownloadCallbacks, DownloadEvent, DownloadHandle, ImageDownloader,
};
pub use fetcher::Fetcher;
