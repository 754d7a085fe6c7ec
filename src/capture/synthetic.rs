//! Synthetic camera producing padded RGBA frames, for running without hardware

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::capture::adapter::{NativeFrame, PlaneLayout};
use crate::CaptureConfig;

/// Moving-gradient source. Every frame it hands out reports back when it
/// is released, so callers can check for leaks.
pub struct SyntheticCamera {
    config: CaptureConfig,
    counter: u64,
    outstanding: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
}

impl SyntheticCamera {
    pub fn new(config: CaptureConfig) -> Self {
        info!(
            "Synthetic camera {}x{} @ {} fps, {} px row padding",
            config.width, config.height, config.fps, config.row_padding
        );
        Self {
            config,
            counter: 0,
            outstanding: Arc::new(AtomicU64::new(0)),
            released: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn next_frame(&mut self) -> SyntheticFrame {
        self.counter += 1;

        let width = self.config.width;
        let height = self.config.height;
        let row_stride = (width + self.config.row_padding) as usize * 4;
        let mut plane = vec![0u8; row_stride * height as usize];
        let shift = self.counter as u32;

        for (y, row) in plane.chunks_mut(row_stride).enumerate() {
            for x in 0..width as usize {
                let px = &mut row[x * 4..x * 4 + 4];
                px[0] = ((x as u32 + shift) % 256) as u8;
                px[1] = ((y as u32 + shift) % 256) as u8;
                px[2] = ((x + y) % 256) as u8;
                px[3] = 255;
            }
        }

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        SyntheticFrame {
            plane,
            layout: PlaneLayout {
                width,
                height,
                row_stride,
                pixel_stride: 4,
            },
            outstanding: self.outstanding.clone(),
            released: self.released.clone(),
            is_released: false,
        }
    }

    /// Frames handed out and not yet released.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

pub struct SyntheticFrame {
    plane: Vec<u8>,
    layout: PlaneLayout,
    outstanding: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
    is_released: bool,
}

impl NativeFrame for SyntheticFrame {
    fn layout(&self) -> PlaneLayout {
        self.layout
    }

    fn plane(&self) -> &[u8] {
        &self.plane
    }

    fn release(&mut self) {
        if !self.is_released {
            self.is_released = true;
            self.plane = Vec::new();
            self.outstanding.fetch_sub(1, Ordering::Relaxed);
        }
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}
