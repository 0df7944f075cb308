//! Offset correction: subtract a reference dark frame from each frame.

use serde::{Deserialize, Serialize};

use crate::capture::frame::{FrameMetadata, PixelFormat};

/// Reference frame captured with the shutter closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl CorrectionFrame {
    fn matches(&self, meta: &FrameMetadata, len: usize) -> bool {
        self.width == meta.width
            && self.height == meta.height
            && self.format == meta.format
            && self.data.len() == len
    }

    /// Subtract in place, clamping at zero. Returns `false` and leaves
    /// `data` untouched when the shapes differ.
    pub fn apply(&self, meta: &FrameMetadata, data: &mut [u8]) -> bool {
        if !self.matches(meta, data.len()) {
            return false;
        }
        match self.format {
            PixelFormat::Mono8 => {
                for (px, dark) in data.iter_mut().zip(&self.data) {
                    *px = px.saturating_sub(*dark);
                }
            }
            PixelFormat::Mono16 => {
                for (px, dark) in data.chunks_exact_mut(2).zip(self.data.chunks_exact(2)) {
                    let value = u16::from_le_bytes([px[0], px[1]]);
                    let dark = u16::from_le_bytes([dark[0], dark[1]]);
                    px.copy_from_slice(&value.saturating_sub(dark).to_le_bytes());
                }
            }
        }
        true
    }
}
