//! Port definition for image decoding collaborators.

use bytes::Bytes;

use crate::domain::entities::CachedImage;
use crate::domain::errors::ImageError;

/// Decodes encoded image bytes into a [`CachedImage`].
///
/// Decoding is CPU-bound; callers invoke implementations from a blocking
/// worker, never on an async task directly.
pub trait ImageDecoderPort: Send + Sync {
    /// Decodes a complete byte payload.
    ///
    /// # Errors
    /// Returns [`ImageError::Decode`] when the bytes are not a decodable
    /// image.
    fn decode(&self, data: &Bytes) -> Result<CachedImage, ImageError>;

    /// Attempts to decode a still-growing payload for progressive display.
    ///
    /// The default treats any decode failure as "not enough data yet".
    fn decode_partial(&self, data: &Bytes) -> Option<CachedImage> {
        self.decode(data).ok()
    }
}
