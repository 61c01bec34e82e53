//! Physical layouts and logical-to-physical index mapping.
//!
//! Logical indices are always given in the canonical order of the buffer's
//! role: `[n, c, h, w]` for activations, `[o, i, kh, kw]` for weights and
//! `[x]` for a bias vector.

use serde::{Deserialize, Serialize};

/// Channel width of one weight block in the `OIhw4i16o4i` layout.
pub const WEIGHT_BLOCK: usize = 16;

/// Input channels interleaved per output channel inside a weight block.
pub const WEIGHT_QUAD: usize = 4;

/// Bytes in one 16x16 weight block.
pub const WEIGHT_BLOCK_LEN: usize = WEIGHT_BLOCK * WEIGHT_BLOCK;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Channel-last activations.
    Nhwc,
    /// Blocked weights: 16x16 (output x input) channel blocks, each holding
    /// `[ic / 4][oc 16][ic 4]`.
    OIhw4i16o4i,
    /// One-dimensional vector (bias).
    X,
}

impl Layout {
    /// Number of logical dimensions this layout describes.
    pub fn rank(&self) -> usize {
        match self {
            Layout::Nhwc | Layout::OIhw4i16o4i => 4,
            Layout::X => 1,
        }
    }

    /// Number of physical elements needed to store `dims`.
    ///
    /// Blocked weights are padded up to whole blocks in both channel axes.
    pub fn physical_len(&self, dims: &[usize]) -> usize {
        match self {
            Layout::Nhwc | Layout::X => dims.iter().product(),
            Layout::OIhw4i16o4i => {
                let o = dims[0].div_ceil(WEIGHT_BLOCK) * WEIGHT_BLOCK;
                let i = dims[1].div_ceil(WEIGHT_BLOCK) * WEIGHT_BLOCK;
                o * i * dims[2] * dims[3]
            }
        }
    }

    /// Physical offset of the element at logical `index` in a buffer of `dims`.
    pub fn offset(&self, dims: &[usize], index: &[usize]) -> usize {
        match self {
            Layout::Nhwc => {
                let (c, h, w) = (dims[1], dims[2], dims[3]);
                ((index[0] * h + index[2]) * w + index[3]) * c + index[1]
            }
            Layout::OIhw4i16o4i => {
                let i_blocks = dims[1].div_ceil(WEIGHT_BLOCK);
                let (kh, kw) = (dims[2], dims[3]);
                let (o, i) = (index[0], index[1]);
                let block = (((o / WEIGHT_BLOCK) * i_blocks + i / WEIGHT_BLOCK) * kh + index[2])
                    * kw
                    + index[3];
                let inner = ((i % WEIGHT_BLOCK) / WEIGHT_QUAD) * WEIGHT_BLOCK * WEIGHT_QUAD
                    + (o % WEIGHT_BLOCK) * WEIGHT_QUAD
                    + i % WEIGHT_QUAD;
                block * WEIGHT_BLOCK_LEN + inner
            }
            Layout::X => index[0],
        }
    }
}
