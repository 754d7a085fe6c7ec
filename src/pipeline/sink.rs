use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::pipeline::latency::{LatencyStats, LatencyWindow};
use crate::pipeline::reconstruct::DisplayImage;

/// What the UI sees: latest image and latest latency, swapped in together.
#[derive(Debug, Clone, Default)]
pub struct SinkState {
    pub image: Option<Arc<DisplayImage>>,
    pub latency_ms: u64,
}

/// Single-writer, multi-reader publish point between the worker and the UI.
pub struct DisplaySink {
    state: ArcSwap<SinkState>,
    window: Mutex<LatencyWindow>,
}

impl DisplaySink {
    pub fn new(window: usize) -> Self {
        Self {
            state: ArcSwap::from_pointee(SinkState::default()),
            window: Mutex::new(LatencyWindow::new(window)),
        }
    }

    /// Replace the current image and latency in one swap.
    pub fn publish(&self, image: DisplayImage, latency: Duration) {
        self.push_latency(latency);
        self.state.store(Arc::new(SinkState {
            image: Some(Arc::new(image)),
            latency_ms: latency.as_millis() as u64,
        }));
    }

    /// Record a latency without touching the image.
    pub fn record_latency(&self, latency: Duration) {
        self.push_latency(latency);
        let current = self.state.load_full();
        self.state.store(Arc::new(SinkState {
            image: current.image.clone(),
            latency_ms: latency.as_millis() as u64,
        }));
    }

    fn push_latency(&self, latency: Duration) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(latency);
    }

    pub fn snapshot(&self) -> Arc<SinkState> {
        self.state.load_full()
    }

    /// `None` until the first successful cycle.
    pub fn current_image(&self) -> Option<Arc<DisplayImage>> {
        self.state.load().image.clone()
    }

    /// 0 until the first measurement.
    pub fn current_latency_ms(&self) -> u64 {
        self.state.load().latency_ms
    }

    /// Window contents, oldest first.
    pub fn latency_window(&self) -> Vec<Duration> {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .collect()
    }

    pub fn latency_stats(&self) -> LatencyStats {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }
}

impl Default for DisplaySink {
    fn default() -> Self {
        Self::new(crate::pipeline::latency::DEFAULT_WINDOW)
    }
}
