use std::time::Duration;

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

pub const DEFAULT_WINDOW: usize = 100;

/// Most recent cycle latencies, oldest first. Never holds more than
/// `capacity` samples; a push into a full window overwrites the oldest.
pub struct LatencyWindow {
    samples: HeapRb<Duration>,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: HeapRb::new(capacity.max(1)),
        }
    }

    pub fn push(&mut self, sample: Duration) {
        self.samples.push_overwrite(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity().get()
    }

    pub fn last(&self) -> Option<Duration> {
        self.samples.iter().last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Duration> + '_ {
        self.samples.iter().copied()
    }

    pub fn stats(&self) -> LatencyStats {
        let Some(last) = self.last() else {
            return LatencyStats::default();
        };

        let mut sorted: Vec<Duration> = self.iter().collect();
        sorted.sort_unstable();

        let total: Duration = sorted.iter().sum();
        let count = sorted.len();
        // Nearest-rank percentile
        let p99_rank = ((count * 99).div_ceil(100)).clamp(1, count);

        LatencyStats {
            count,
            last_ms: as_ms(last),
            min_ms: as_ms(sorted[0]),
            max_ms: as_ms(sorted[count - 1]),
            avg_ms: as_ms(total) / count as f64,
            p99_ms: as_ms(sorted[p99_rank - 1]),
        }
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// Aggregate view over a [`LatencyWindow`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub count: usize,
    pub last_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p99_ms: f64,
}
