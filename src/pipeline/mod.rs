//! Frame processing pipeline: gate → dispatcher → reconstruction → sink

pub mod dispatch;
pub mod gate;
pub mod latency;
pub mod reconstruct;
pub mod sink;

use std::sync::Arc;

use flume::Receiver;
use metrics::histogram;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub use dispatch::{Dispatcher, FrameTransform};
pub use gate::{CycleState, FrameGate, GateStats, Offer};
pub use latency::{LatencyStats, LatencyWindow};
pub use reconstruct::{reconstruct, DisplayImage};
pub use sink::{DisplaySink, SinkState};

use crate::capture::FrameSourceAdapter;
use crate::error::Result;
use crate::{Metrics, PipelineConfig};
use gate::Cycle;

/// Running pipeline. Frames enter through [`Pipeline::adapter`], results
/// come out of [`Pipeline::sink`].
pub struct Pipeline {
    gate: Arc<FrameGate>,
    sink: Arc<DisplaySink>,
    adapter: FrameSourceAdapter,
    shutdown: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl Pipeline {
    /// Spawn the processing worker on the current tokio runtime.
    pub fn spawn(config: PipelineConfig, transform: Arc<dyn FrameTransform>) -> Result<Self> {
        config.validate()?;

        let (gate, rx) = FrameGate::new();
        let gate = Arc::new(gate);
        let sink = Arc::new(DisplaySink::new(config.latency_window));
        let shutdown = Arc::new(Notify::new());

        info!(
            "Starting pipeline: transform {}, output {}x{}, timeout {:?}",
            transform.name(),
            config.output_width,
            config.output_height,
            config.transform_timeout()
        );

        let worker = Worker {
            dispatcher: Dispatcher::new(transform, config.transform_timeout()),
            sink: sink.clone(),
            output_width: config.output_width,
            output_height: config.output_height,
            record_failed_latency: config.record_failed_latency,
        };
        let worker = tokio::spawn(worker.run(rx, shutdown.clone()));

        Ok(Self {
            adapter: FrameSourceAdapter::new(gate.clone()),
            gate,
            sink,
            shutdown,
            worker,
        })
    }

    pub fn gate(&self) -> &Arc<FrameGate> {
        &self.gate
    }

    pub fn sink(&self) -> &Arc<DisplaySink> {
        &self.sink
    }

    /// Adapter to call from the camera's frame callback.
    pub fn adapter(&self) -> FrameSourceAdapter {
        self.adapter.clone()
    }

    pub fn metrics(&self) -> Metrics {
        let gate = self.gate.stats();
        let latency = self.sink.latency_stats();
        Metrics {
            frames_offered: gate.offered,
            frames_accepted: gate.accepted,
            dropped_frames: gate.dropped,
            cycles_completed: gate.completed,
            cycles_failed: gate.failed,
            current_latency_ms: self.sink.current_latency_ms(),
            avg_latency_ms: latency.avg_ms,
            p99_latency_ms: latency.p99_ms,
        }
    }

    /// Stop the worker once the in-flight cycle, if any, has finished.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.worker.await {
            warn!("Pipeline worker ended abnormally: {}", e);
        }
        info!("Pipeline stopped");
    }
}

struct Worker {
    dispatcher: Dispatcher,
    sink: Arc<DisplaySink>,
    output_width: u32,
    output_height: u32,
    record_failed_latency: bool,
}

impl Worker {
    async fn run(self, rx: Receiver<Cycle>, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                next = rx.recv_async() => match next {
                    Ok(cycle) => self.run_cycle(cycle).await,
                    Err(_) => break,
                },
            }
        }
        debug!("Pipeline worker exiting");
    }

    async fn run_cycle(&self, cycle: Cycle) {
        let (frame, accepted_at, guard) = cycle.into_parts();
        let sequence = frame.sequence();

        guard.dispatched();
        let outcome = match self.dispatcher.dispatch(frame).await {
            Ok(output) => reconstruct(output, self.output_width, self.output_height, sequence),
            Err(e) => Err(e),
        };

        let latency = accepted_at.elapsed();
        histogram!("framegate_cycle_seconds").record(latency.as_secs_f64());

        match outcome {
            Ok(image) => {
                self.sink.publish(image, latency);
                trace!(sequence, ?latency, "Cycle completed");
                guard.complete();
            }
            Err(e) => {
                warn!(sequence, ?latency, "Cycle failed: {}", e);
                if self.record_failed_latency {
                    self.sink.record_latency(latency);
                }
                guard.fail();
            }
        }
    }
}
