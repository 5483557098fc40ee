//! Port definitions for the image pipeline.

mod cache_port;
mod decoder_port;
mod operation;
mod transformer_port;

pub use cache_port::{CacheHit, DiskCachePort, ImageCachePort, MemoryCachePort};
pub use decoder_port::ImageDecoderPort;
pub use operation::CancellableOperation;
pub use transformer_port::ImageTransformerPort;
