//! Orientation fix-up for delivered frames.
//!
//! The quarter turn (counter-clockwise) is applied first, then the flips.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::capture::frame::FrameMetadata;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transform {
    /// Mirror columns.
    pub flip_lr: bool,
    /// Mirror rows.
    pub flip_ud: bool,
    pub rot90: bool,
}

impl Transform {
    pub const IDENTITY: Self = Self {
        flip_lr: false,
        flip_ud: false,
        rot90: false,
    };

    pub fn new(flip_lr: bool, flip_ud: bool, rot90: bool) -> Self {
        Self {
            flip_lr,
            flip_ud,
            rot90,
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Component-wise exclusive or; combining with the same transform again
    /// undoes it.
    pub fn combine(self, other: Self) -> Self {
        Self {
            flip_lr: self.flip_lr ^ other.flip_lr,
            flip_ud: self.flip_ud ^ other.flip_ud,
            rot90: self.rot90 ^ other.rot90,
        }
    }

    pub fn output_shape(&self, width: u32, height: u32) -> (u32, u32) {
        if self.rot90 {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Write the reoriented pixels of `src` into `dst` and return the
    /// metadata of the result. `None` if `src` is shorter than `meta` says.
    pub fn apply(&self, meta: &FrameMetadata, src: &[u8], dst: &mut BytesMut) -> Option<FrameMetadata> {
        let bpp = meta.format.bytes_per_pixel();
        let (w, h) = (meta.width as usize, meta.height as usize);
        let bytes = w * h * bpp;
        if src.len() < bytes {
            return None;
        }
        let (out_w, out_h) = if self.rot90 { (h, w) } else { (w, h) };

        dst.clear();
        dst.reserve(bytes);
        for row in 0..out_h {
            let r = if self.flip_ud { out_h - 1 - row } else { row };
            for col in 0..out_w {
                let c = if self.flip_lr { out_w - 1 - col } else { col };
                let (src_row, src_col) = if self.rot90 { (c, w - 1 - r) } else { (r, c) };
                let at = (src_row * w + src_col) * bpp;
                dst.extend_from_slice(&src[at..at + bpp]);
            }
        }

        let (width, height) = self.output_shape(meta.width, meta.height);
        Some(FrameMetadata {
            width,
            height,
            ..*meta
        })
    }
}
