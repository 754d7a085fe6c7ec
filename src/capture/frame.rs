use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::{PipelineError, Result};

/// Immutable RGBA frame owned by exactly one pipeline stage at a time.
pub struct RawFrame {
    /// Tightly packed pixel rows, no padding
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// When the pixels were copied out of the native buffer
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgba8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
        }
    }

    /// Length of a packed buffer of `width` x `height` pixels.
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let data = data.into();
        let format = PixelFormat::Rgba8;
        let expected = format.buffer_len(width, height);
        if data.len() != expected {
            return Err(PipelineError::Extraction(format!(
                "{}x{} RGBA frame needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }

        Ok(Self {
            data,
            meta: FrameMetadata {
                sequence,
                width,
                height,
                format,
            },
            timestamp: Instant::now(),
        })
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .finish()
    }
}
