//! Runs the external transform off the capture path

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::capture::RawFrame;
use crate::error::{PipelineError, Result, TransformError};

/// The opaque frame transform. Takes one packed RGBA frame, returns a
/// packed RGBA buffer of the agreed output size, or `None` when it has
/// nothing to show. May block for as long as it likes.
pub trait FrameTransform: Send + Sync + 'static {
    fn transform(&self, frame: RawFrame) -> Result<Option<Vec<u8>>, TransformError>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> FrameTransform for F
where
    F: Fn(RawFrame) -> Result<Option<Vec<u8>>, TransformError> + Send + Sync + 'static,
{
    fn transform(&self, frame: RawFrame) -> Result<Option<Vec<u8>>, TransformError> {
        self(frame)
    }
}

/// Hands frames to a [`FrameTransform`] on tokio's blocking pool and
/// waits at most `timeout` for the answer.
#[derive(Clone)]
pub struct Dispatcher {
    transform: Arc<dyn FrameTransform>,
    timeout: Duration,
    /// Single permit, held by whichever call is inside the transform,
    /// including one whose cycle has already timed out
    slot: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(transform: Arc<dyn FrameTransform>, timeout: Duration) -> Self {
        Self {
            transform,
            timeout,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// At most one transform call per frame, no retries, and never two
    /// calls inside the transform at once.
    ///
    /// On timeout the blocking call is abandoned, not cancelled: it keeps
    /// the transform slot until it returns, and its output is thrown away.
    /// The next frame waits for the slot within its own timeout, so a hung
    /// transform fails every later cycle without starting another call.
    #[instrument(skip_all, fields(sequence = frame.sequence()))]
    pub async fn dispatch(&self, frame: RawFrame) -> Result<Vec<u8>> {
        let transform = self.transform.clone();
        let slot = self.slot.clone();
        let started = Instant::now();
        let call = async move {
            let permit = slot
                .acquire_owned()
                .await
                .map_err(|_| TransformError::Failed("transform slot closed".into()))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                transform.transform(frame)
            })
            .await
            .map_err(|join| PipelineError::TransformPanicked(join.to_string()))
        };

        let output = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                warn!(
                    "Transform {} still running after {:?}, abandoning it",
                    self.transform.name(),
                    self.timeout
                );
                return Err(PipelineError::Timeout(self.timeout));
            }
            Ok(joined) => joined??,
        };

        let elapsed = started.elapsed();
        histogram!("framegate_transform_seconds").record(elapsed.as_secs_f64());
        debug!("Transform returned in {:?}", elapsed);

        output.ok_or(PipelineError::EmptyResult)
    }
}
