use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One reusable slot of the buffer pool.
///
/// The data region is allocated once when the pool is sized and is only
/// written by the acquirer; after `mark_filled` it is read-only until the
/// pool zeroes it on release.
#[derive(Debug)]
pub struct Frame {
    pub(crate) data: Vec<u8>,

    /// Valid bytes in `data`, set when the hardware fills the slot
    pub(crate) len: usize,

    pub meta: FrameMetadata,

    /// Pool allocation this slot belongs to
    pub(crate) generation: u64,
}

impl Frame {
    pub(crate) fn zeroed(capacity: usize, generation: u64) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
            meta: FrameMetadata::default(),
            generation,
        }
    }

    /// Filled bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Exchange the slot's storage with a buffer the hardware just filled.
    pub(crate) fn swap_buffer(&mut self, buffer: &mut Vec<u8>) {
        std::mem::swap(&mut self.data, buffer);
    }

    pub(crate) fn reset(&mut self) {
        self.data.fill(0);
        self.len = 0;
        self.meta = FrameMetadata::default();
    }
}

/// Frame metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per pixel
    pub stride: u32,
    pub format: PixelFormat,
    /// Device clock at readout
    pub timestamp: Duration,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    #[default]
    Mono16,
}

impl PixelFormat {
    pub fn from_bytes_per_pixel(bpp: usize) -> Option<Self> {
        match bpp {
            1 => Some(PixelFormat::Mono8),
            2 => Some(PixelFormat::Mono16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono16 => 2,
        }
    }
}
