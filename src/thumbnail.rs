//! Square WebP thumbnails.
//!
//! The largest centered square of the source is cropped, resized to the
//! configured edge with Lanczos3 and encoded to lossy WebP.

use anyhow::{Context, Result};
use image::{imageops::FilterType, GenericImageView};

use crate::config::ThumbnailConfig;

pub trait ThumbnailGenerator: Send + Sync {
    fn generate(&self, source: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct ImageThumbnailer {
    size: u32,
    quality: u8,
}

impl ImageThumbnailer {
    pub fn new(size: u32, quality: u8) -> Self {
        Self { size, quality }
    }

    pub fn from_config(config: &ThumbnailConfig) -> Self {
        Self::new(config.size, config.quality)
    }
}

/// Offset and edge of the largest square centered in a `width` x `height` image.
pub fn center_square(width: u32, height: u32) -> (u32, u32, u32) {
    let edge = width.min(height);
    ((width - edge) / 2, (height - edge) / 2, edge)
}

impl ThumbnailGenerator for ImageThumbnailer {
    fn generate(&self, source: &[u8]) -> Result<Vec<u8>> {
        let img = image::load_from_memory(source).context("Failed to decode image")?;

        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            anyhow::bail!("image has no pixels");
        }

        let (x, y, edge) = center_square(width, height);
        let square = img
            .crop_imm(x, y, edge, edge)
            .resize_exact(self.size, self.size, FilterType::Lanczos3);

        let rgba = square.to_rgba8();
        let (w, h) = rgba.dimensions();

        let encoder = webp::Encoder::from_rgba(&rgba, w, h);
        let encoded = encoder.encode(self.quality as f32);

        Ok(encoded.to_vec())
    }
}
