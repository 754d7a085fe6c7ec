//! Process-wide processing environment, started once before the first cycle

use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::error::Result;
use crate::pipeline::FrameTransform;
use crate::{transform, PipelineConfig, TransformConfig};

static ENVIRONMENT: OnceCell<ProcessingEnvironment> = OnceCell::new();

pub struct ProcessingEnvironment {
    config: TransformConfig,
    transform: Arc<dyn FrameTransform>,
    started_at: Instant,
}

impl ProcessingEnvironment {
    /// Start the environment, or return the one already running. Later
    /// calls never rebuild it, whatever configuration they pass.
    pub fn start(config: &TransformConfig, pipeline: &PipelineConfig) -> Result<&'static Self> {
        let env = ENVIRONMENT.get_or_try_init(|| {
            let transform = transform::build(config, pipeline)?;
            info!("Processing environment started with {}", transform.name());
            Ok::<_, crate::PipelineError>(Self {
                config: config.clone(),
                transform,
                started_at: Instant::now(),
            })
        })?;

        if env.config != *config {
            warn!(
                "Processing environment already running {:?}, ignoring {:?}",
                env.config, config
            );
        }
        Ok(env)
    }

    pub fn get() -> Option<&'static Self> {
        ENVIRONMENT.get()
    }

    pub fn transform(&self) -> Arc<dyn FrameTransform> {
        self.transform.clone()
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}
