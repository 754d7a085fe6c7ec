//! Turn transform output back into a displayable, orientation-corrected image

use std::path::Path;

use color_eyre::Result as EyreResult;
use image::{imageops, RgbaImage};
use tracing::info;

use crate::capture::PixelFormat;
use crate::error::{PipelineError, Result};

/// Image ready for presentation.
#[derive(Debug, Clone)]
pub struct DisplayImage {
    pixels: RgbaImage,
    sequence: u64,
}

impl DisplayImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Sequence number of the camera frame this image came from.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn as_raw(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    /// Write the image as PNG.
    pub fn save(&self, path: &Path) -> EyreResult<()> {
        self.pixels.save_with_format(path, image::ImageFormat::Png)?;
        info!("Saved {}x{} snapshot to {}", self.width(), self.height(), path.display());
        Ok(())
    }
}

/// Sensor-to-display orientation correction: 90 degrees clockwise.
pub fn orient(image: &RgbaImage) -> RgbaImage {
    imageops::rotate90(image)
}

/// Decode `data` as a `width` x `height` RGBA buffer and orient it.
pub fn reconstruct(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<DisplayImage> {
    let expected = PixelFormat::Rgba8.buffer_len(width, height);
    let actual = data.len();
    if actual != expected {
        return Err(PipelineError::Decode { expected, actual });
    }

    let decoded =
        RgbaImage::from_raw(width, height, data).ok_or(PipelineError::Decode { expected, actual })?;

    Ok(DisplayImage {
        pixels: orient(&decoded),
        sequence,
    })
}
