//! Decoded image payloads and their eviction cost.

use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;

/// A decoded image together with its original encoded byte payload.
///
/// Cloning is cheap: the decoded bitmap is shared behind an [`Arc`] and the
/// encoded payload is a reference-counted [`Bytes`] buffer.
#[derive(Debug, Clone)]
pub struct CachedImage {
    image: Arc<DynamicImage>,
    data: Bytes,
    scale: f32,
    frame_count: u32,
    format: Option<image::ImageFormat>,
}

/// Assumed bytes per pixel for cost accounting (RGBA8).
const BYTES_PER_PIXEL: u64 = 4;

impl CachedImage {
    /// Creates a static (single-frame, scale 1.0) cached image.
    #[must_use]
    pub fn new(image: Arc<DynamicImage>, data: Bytes, format: Option<image::ImageFormat>) -> Self {
        Self {
            image,
            data,
            scale: 1.0,
            frame_count: 1,
            format,
        }
    }

    /// Sets the scale factor (display points to pixels).
    #[must_use]
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Sets the frame count (`> 1` for animated images).
    #[must_use]
    pub fn with_frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count.max(1);
        self
    }

    /// The decoded bitmap.
    #[must_use]
    pub fn image(&self) -> &Arc<DynamicImage> {
        &self.image
    }

    /// The original encoded bytes, empty when constructed without them.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Pixel width.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Pixel height.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Scale factor.
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Number of frames; 1 for static images.
    #[must_use]
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Encoded format tag, when known.
    #[must_use]
    pub fn format(&self) -> Option<image::ImageFormat> {
        self.format
    }

    /// Memory footprint attributed to this image for eviction accounting:
    /// `width x height x scale^2 x bytes-per-pixel x frame_count`.
    #[must_use]
    pub fn memory_cost(&self) -> u64 {
        let pixels = f64::from(self.width()) * f64::from(self.height());
        let scaled = pixels * f64::from(self.scale) * f64::from(self.scale);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = scaled.max(0.0).round() as u64;
        scaled
            .saturating_mul(BYTES_PER_PIXEL)
            .saturating_mul(u64::from(self.frame_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_of(width: u32, height: u32) -> CachedImage {
        CachedImage::new(
            Arc::new(DynamicImage::new_rgb8(width, height)),
            Bytes::new(),
            None,
        )
    }

    #[test]
    fn cost_is_pixels_times_bytes_per_pixel() {
        assert_eq!(image_of(10, 10).memory_cost(), 400);
        assert_eq!(image_of(0, 10).memory_cost(), 0);
    }

    #[test]
    fn cost_scales_quadratically_with_scale() {
        let img = image_of(10, 10).with_scale(2.0);
        assert_eq!(img.memory_cost(), 1600);
    }

    #[test]
    fn cost_multiplies_by_frame_count() {
        let img = image_of(10, 10).with_frame_count(3);
        assert_eq!(img.memory_cost(), 1200);
    }

    #[test]
    fn frame_count_is_at_least_one() {
        let img = image_of(10, 10).with_frame_count(0);
        assert_eq!(img.frame_count(), 1);
    }
}
