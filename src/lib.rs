pub mod capture;
pub mod environment;
pub mod error;
pub mod pipeline;
pub mod transform;

use std::path::{Path, PathBuf};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use capture::{Delivery, FrameSourceAdapter, NativeFrame, PlaneLayout, RawFrame};
pub use environment::ProcessingEnvironment;
pub use error::{PipelineError, Result, TransformError};
pub use pipeline::{DisplayImage, DisplaySink, FrameTransform, Pipeline};

/// Prefix for environment variable overrides, e.g. `FRAMEGATE__PIPELINE__TRANSFORM_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "FRAMEGATE";

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub transform: TransformConfig,
    pub display: DisplayConfig,
}

/// Synthetic camera settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Extra pixels at the end of every row, as some sensors pad to a stride
    pub row_padding: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Dimensions the transform is agreed to return
    pub output_width: u32,
    pub output_height: u32,
    pub latency_window: usize,
    pub transform_timeout_ms: u64,
    /// Time failed cycles into the latency window and current value too.
    /// Off leaves both untouched when a cycle fails.
    pub record_failed_latency: bool,
}

/// Which transform the processing environment runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformConfig {
    Passthrough,
    Blur {
        sigma: f32,
    },
    Invert,
    /// External program: RGBA on stdin, RGBA on stdout
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Where to write the last displayed image on shutdown
    pub snapshot_path: Option<PathBuf>,
    pub stats_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            row_padding: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_width: 640,
            output_height: 480,
            latency_window: pipeline::latency::DEFAULT_WINDOW,
            transform_timeout_ms: 1000,
            record_failed_latency: true,
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        TransformConfig::Blur { sigma: 2.0 }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            stats_interval_ms: 1000,
        }
    }
}

impl PipelineConfig {
    pub fn transform_timeout(&self) -> Duration {
        Duration::from_millis(self.transform_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.output_width == 0 || self.output_height == 0 {
            return Err(PipelineError::Config(format!(
                "output size {}x{} is empty",
                self.output_width, self.output_height
            )));
        }
        if self.latency_window == 0 {
            return Err(PipelineError::Config("latency window must hold at least one sample".into()));
        }
        if self.transform_timeout_ms == 0 {
            return Err(PipelineError::Config("transform timeout must be non-zero".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `FRAMEGATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> color_eyre::Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.width == 0 || self.capture.height == 0 || self.capture.fps == 0 {
            return Err(PipelineError::Config(format!(
                "capture {}x{} @ {} fps is not usable",
                self.capture.width, self.capture.height, self.capture.fps
            )));
        }
        self.pipeline.validate()
    }
}

/// Performance metrics collected throughout the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metrics {
    pub frames_offered: u64,
    pub frames_accepted: u64,
    pub dropped_frames: u64,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub current_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
}
