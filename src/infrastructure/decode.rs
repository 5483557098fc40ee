//! Default image decoding collaborator.

use std::sync::Arc;

use bytes::Bytes;

use crate::domain::entities::CachedImage;
use crate::domain::errors::ImageError;
use crate::domain::ports::ImageDecoderPort;

/// Decoder backed by the `image` crate.
///
/// Produces fully decoded bitmaps; the format tag is guessed from the byte
/// payload. Animated sources decode to their first frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultImageDecoder;

impl ImageDecoderPort for DefaultImageDecoder {
    fn decode(&self, data: &Bytes) -> Result<CachedImage, ImageError> {
        let format = image::guess_format(data).ok();
        let decoded =
            image::load_from_memory(data).map_err(|err| ImageError::decode(err.to_string()))?;
        Ok(CachedImage::new(Arc::new(decoded), data.clone(), format))
    }
}
