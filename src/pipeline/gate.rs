//! Single-slot backpressure gate: accept the newest frame only when idle

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};
use metrics::counter;
use tracing::{trace, warn};

use crate::capture::RawFrame;

/// Per-cycle state machine. The gate is open in `Idle` and in the two
/// terminal states, which always fall back to `Idle`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle = 0,
    Accepted = 1,
    Dispatched = 2,
    Completed = 3,
    Failed = 4,
}

impl CycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CycleState::Accepted,
            2 => CycleState::Dispatched,
            3 => CycleState::Completed,
            4 => CycleState::Failed,
            _ => CycleState::Idle,
        }
    }

    /// True while a cycle holds the gate.
    pub fn is_active(self) -> bool {
        matches!(self, CycleState::Accepted | CycleState::Dispatched)
    }
}

/// Outcome of [`FrameGate::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    Dropped,
}

#[derive(Default)]
struct Stats {
    offered: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of gate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub offered: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
}

struct Shared {
    /// The single authoritative "cycle active" flag
    state: CachePadded<AtomicU8>,
    stats: CachePadded<Stats>,
}

impl Shared {
    fn state(&self) -> CycleState {
        CycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn try_begin(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if CycleState::from_u8(current).is_active() {
                    None
                } else {
                    Some(CycleState::Accepted as u8)
                }
            })
            .is_ok()
    }
}

/// Capacity-one gate in front of the processing worker.
///
/// Accepted frames travel to the worker over a bounded(1) channel. The
/// channel can never be full when a frame is accepted, because the
/// previous cycle has already been taken off it by the time the gate
/// reopens.
pub struct FrameGate {
    shared: Arc<Shared>,
    slot: Sender<Cycle>,
}

impl FrameGate {
    /// Create a gate plus the receiving end the worker drains.
    pub fn new() -> (Self, Receiver<Cycle>) {
        let (slot, rx) = flume::bounded(1);
        let gate = Self {
            shared: Arc::new(Shared {
                state: CachePadded::new(AtomicU8::new(CycleState::Idle as u8)),
                stats: CachePadded::new(Stats::default()),
            }),
            slot,
        };
        (gate, rx)
    }

    /// Begin a cycle with `frame` if idle, otherwise drop it immediately.
    /// Never blocks.
    pub fn offer(&self, frame: RawFrame) -> Offer {
        let stats = &self.shared.stats;
        stats.offered.fetch_add(1, Ordering::Relaxed);
        counter!("framegate_frames_offered_total").increment(1);

        if !self.shared.try_begin() {
            trace!(sequence = frame.sequence(), "cycle in flight, dropping frame");
            drop(frame);
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("framegate_frames_dropped_total").increment(1);
            return Offer::Dropped;
        }

        let cycle = Cycle {
            frame,
            accepted_at: Instant::now(),
            guard: CycleGuard {
                shared: self.shared.clone(),
                finished: None,
            },
        };

        match self.slot.try_send(cycle) {
            Ok(()) => {
                stats.accepted.fetch_add(1, Ordering::Relaxed);
                counter!("framegate_frames_accepted_total").increment(1);
                Offer::Accepted
            }
            Err(err) => {
                // Dropping the returned cycle runs its guard and reopens the gate.
                match err {
                    TrySendError::Disconnected(_) => warn!("processing worker is gone, dropping frame"),
                    TrySendError::Full(_) => warn!("frame slot unexpectedly occupied, dropping frame"),
                }
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("framegate_frames_dropped_total").increment(1);
                Offer::Dropped
            }
        }
    }

    pub fn state(&self) -> CycleState {
        self.shared.state()
    }

    pub fn is_idle(&self) -> bool {
        !self.state().is_active()
    }

    pub fn stats(&self) -> GateStats {
        let stats = &self.shared.stats;
        GateStats {
            offered: stats.offered.load(Ordering::Relaxed),
            accepted: stats.accepted.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
        }
    }
}

/// One accepted frame on its way through the worker.
pub struct Cycle {
    pub frame: RawFrame,
    /// When the gate accepted the frame; latency is measured from here
    pub accepted_at: Instant,
    guard: CycleGuard,
}

impl Cycle {
    pub fn into_parts(self) -> (RawFrame, Instant, CycleGuard) {
        (self.frame, self.accepted_at, self.guard)
    }
}

/// Holds the gate closed for the lifetime of a cycle. Dropping it, on any
/// path including unwinding, reopens the gate.
pub struct CycleGuard {
    shared: Arc<Shared>,
    finished: Option<CycleState>,
}

impl CycleGuard {
    pub fn dispatched(&self) {
        self.shared
            .state
            .store(CycleState::Dispatched as u8, Ordering::Release);
    }

    pub fn complete(self) {
        self.finish(CycleState::Completed);
    }

    pub fn fail(self) {
        self.finish(CycleState::Failed);
    }

    fn finish(mut self, terminal: CycleState) {
        let stats = &self.shared.stats;
        match terminal {
            CycleState::Completed => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
                counter!("framegate_cycles_completed_total").increment(1);
            }
            _ => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                counter!("framegate_cycles_failed_total").increment(1);
            }
        }
        self.shared.state.store(terminal as u8, Ordering::Release);
        self.finished = Some(terminal);
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        match self.finished.take() {
            // A new cycle may already have been accepted from the terminal state.
            Some(terminal) => {
                let _ = self.shared.state.compare_exchange(
                    terminal as u8,
                    CycleState::Idle as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            None => self
                .shared
                .state
                .store(CycleState::Idle as u8, Ordering::Release),
        }
    }
}
