//! Frame source adapter: native frame in, packed RGBA frame out

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use metrics::counter;
use tracing::{instrument, warn};

use crate::capture::frame::{PixelFormat, RawFrame};
use crate::error::{PipelineError, Result};
use crate::pipeline::{FrameGate, Offer};

/// Memory layout of a single RGBA plane as handed over by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    /// Bytes from the start of one row to the next, padding included
    pub row_stride: usize,
    /// Bytes per pixel
    pub pixel_stride: usize,
}

impl PlaneLayout {
    pub fn packed(width: u32, height: u32) -> Self {
        let pixel_stride = PixelFormat::Rgba8.bytes_per_pixel();
        Self {
            width,
            height,
            row_stride: width as usize * pixel_stride,
            pixel_stride,
        }
    }
}

/// A camera frame backed by a native resource that must be released
/// exactly once, promptly, by the receiver.
pub trait NativeFrame {
    fn layout(&self) -> PlaneLayout;

    fn plane(&self) -> &[u8];

    fn release(&mut self);
}

/// Releases the wrapped native frame when dropped.
struct ReleaseOnDrop<F: NativeFrame>(F);

impl<F: NativeFrame> Deref for ReleaseOnDrop<F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.0
    }
}

impl<F: NativeFrame> Drop for ReleaseOnDrop<F> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Copy the visible pixels out of a possibly padded plane.
pub fn extract_frame(plane: &[u8], layout: PlaneLayout, sequence: u64) -> Result<RawFrame> {
    let PlaneLayout {
        width,
        height,
        row_stride,
        pixel_stride,
    } = layout;

    if width == 0 || height == 0 {
        return Err(PipelineError::Extraction(format!(
            "empty frame {}x{}",
            width, height
        )));
    }
    if pixel_stride != PixelFormat::Rgba8.bytes_per_pixel() {
        return Err(PipelineError::Extraction(format!(
            "unsupported pixel stride {}",
            pixel_stride
        )));
    }

    let row_len = width as usize * pixel_stride;
    if row_stride < row_len {
        return Err(PipelineError::Extraction(format!(
            "row stride {} shorter than row of {} bytes",
            row_stride, row_len
        )));
    }

    // The last row does not need to carry its padding.
    let needed = row_stride
        .checked_mul(height as usize - 1)
        .and_then(|rows| rows.checked_add(row_len))
        .ok_or_else(|| {
            PipelineError::Extraction(format!(
                "row stride {} x {} rows overflows",
                row_stride, height
            ))
        })?;
    if plane.len() < needed {
        return Err(PipelineError::Extraction(format!(
            "plane holds {} bytes, layout needs {}",
            plane.len(),
            needed
        )));
    }

    let data = if row_stride == row_len {
        Bytes::copy_from_slice(&plane[..row_len * height as usize])
    } else {
        let mut packed = BytesMut::with_capacity(row_len * height as usize);
        for row in plane.chunks(row_stride).take(height as usize) {
            packed.extend_from_slice(&row[..row_len]);
        }
        packed.freeze()
    };

    RawFrame::new(data, width, height, sequence)
}

/// What happened to a delivered native frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Extracted and accepted by the gate; a cycle has started
    Accepted,
    /// Extracted but a cycle was already in flight
    Dropped,
    /// Extraction failed; no cycle started
    Rejected,
}

/// Entry point for the camera's frame callback.
#[derive(Clone)]
pub struct FrameSourceAdapter {
    gate: Arc<FrameGate>,
    sequence: Arc<AtomicU64>,
}

impl FrameSourceAdapter {
    pub fn new(gate: Arc<FrameGate>) -> Self {
        Self {
            gate,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Convert and release `native`, then offer the result to the gate.
    ///
    /// The native frame is released before this returns, whatever the
    /// outcome, and exactly once.
    #[instrument(skip_all)]
    pub fn deliver<F: NativeFrame>(&self, native: F) -> Delivery {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let native = ReleaseOnDrop(native);
        let extracted = extract_frame(native.plane(), native.layout(), sequence);
        drop(native);

        match extracted {
            Ok(frame) => match self.gate.offer(frame) {
                Offer::Accepted => Delivery::Accepted,
                Offer::Dropped => Delivery::Dropped,
            },
            Err(e) => {
                warn!(sequence, "Dropping frame: {}", e);
                counter!("framegate_extraction_failures_total").increment(1);
                Delivery::Rejected
            }
        }
    }

    /// Sequence number the next delivered frame will get.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}
