//! Concrete frame transforms the processing environment can run

pub mod builtin;
pub mod command;

use std::sync::Arc;

pub use builtin::{ImageTransform, Operation};
pub use command::CommandTransform;

use crate::error::{PipelineError, Result};
use crate::pipeline::FrameTransform;
use crate::{PipelineConfig, TransformConfig};

/// Build the transform named by `config`, producing output of the size
/// `pipeline` expects.
pub fn build(config: &TransformConfig, pipeline: &PipelineConfig) -> Result<Arc<dyn FrameTransform>> {
    let (width, height) = (pipeline.output_width, pipeline.output_height);
    let transform: Arc<dyn FrameTransform> = match config {
        TransformConfig::Passthrough => {
            Arc::new(ImageTransform::new(Operation::Passthrough, width, height))
        }
        TransformConfig::Blur { sigma } => {
            if !sigma.is_finite() || *sigma <= 0.0 {
                return Err(PipelineError::Config(format!("blur sigma {} must be positive", sigma)));
            }
            Arc::new(ImageTransform::new(Operation::Blur { sigma: *sigma }, width, height).live())
        }
        TransformConfig::Invert => Arc::new(ImageTransform::new(Operation::Invert, width, height)),
        TransformConfig::Command { program, args } => {
            if program.trim().is_empty() {
                return Err(PipelineError::Config("command transform needs a program".into()));
            }
            Arc::new(CommandTransform::new(
                program.clone(),
                args.clone(),
                width,
                height,
                pipeline.transform_timeout(),
            ))
        }
    };
    Ok(transform)
}
