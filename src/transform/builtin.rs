use image::imageops::{self, FilterType};
use image::RgbaImage;

use crate::capture::RawFrame;
use crate::error::TransformError;
use crate::pipeline::FrameTransform;
use crate::TransformConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    Passthrough,
    Blur { sigma: f32 },
    Invert,
}

/// In-process transform built on the `image` crate. Input of any size is
/// scaled to the output size first.
#[derive(Debug, Clone)]
pub struct ImageTransform {
    op: Operation,
    width: u32,
    height: u32,
    live: bool,
}

impl ImageTransform {
    pub fn new(op: Operation, width: u32, height: u32) -> Self {
        Self {
            op,
            width,
            height,
            live: false,
        }
    }

    /// Follow the global [`crate::CONFIG`]: while it names a blur, its sigma
    /// replaces the one this transform was built with.
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    fn sigma(&self, built_with: f32) -> f32 {
        if !self.live {
            return built_with;
        }
        match &crate::CONFIG.load().transform {
            TransformConfig::Blur { sigma } if sigma.is_finite() && *sigma > 0.0 => *sigma,
            _ => built_with,
        }
    }
}

impl FrameTransform for ImageTransform {
    fn transform(&self, frame: RawFrame) -> Result<Option<Vec<u8>>, TransformError> {
        let (width, height) = (frame.width(), frame.height());
        let input = RgbaImage::from_raw(width, height, frame.data.to_vec()).ok_or_else(|| {
            TransformError::InvalidInput(format!("{} bytes for {}x{}", frame.data.len(), width, height))
        })?;

        let mut image = if (width, height) == (self.width, self.height) {
            input
        } else {
            imageops::resize(&input, self.width, self.height, FilterType::Triangle)
        };

        match self.op {
            Operation::Passthrough => {}
            Operation::Blur { sigma } => image = imageops::blur(&image, self.sigma(sigma)),
            Operation::Invert => imageops::invert(&mut image),
        }

        Ok(Some(image.into_raw()))
    }

    fn name(&self) -> &str {
        match self.op {
            Operation::Passthrough => "passthrough",
            Operation::Blur { .. } => "blur",
            Operation::Invert => "invert",
        }
    }
}
