use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = PipelineError> = core::result::Result<T, E>;

/// Everything that can end a cycle early. None of these are fatal: the
/// worker logs them and the gate reopens for the next frame.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame extraction failed: {0}")]
    Extraction(String),
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("transform returned no data")]
    EmptyResult,
    #[error("transform timed out after {0:?}")]
    Timeout(Duration),
    #[error("transform panicked: {0}")]
    TransformPanicked(String),
    #[error("output buffer is {actual} bytes, expected {expected}")]
    Decode { expected: usize, actual: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure reported by a [`crate::FrameTransform`] implementation.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    Failed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("process exited with {0}")]
    ExitStatus(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
