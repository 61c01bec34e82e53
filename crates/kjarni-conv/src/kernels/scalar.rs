//! Portable micro-kernel.

use crate::tensor::layout::{WEIGHT_BLOCK, WEIGHT_BLOCK_LEN, WEIGHT_QUAD};

/// Accumulates one source pixel against 16 output channels.
///
/// `src` holds the pixel's input channels of one group (a multiple of 16).
/// `weights` starts at the first input block of a 16-wide output block for
/// one kernel position; consecutive input blocks are `ib_stride` apart.
/// `acc` holds the 16 output channel accumulators and is added to.
pub fn accumulate_pixel(src: &[u8], weights: &[i8], ib_stride: usize, acc: &mut [i32]) {
    for (ib, src_block) in src.chunks_exact(WEIGHT_BLOCK).enumerate() {
        let block = &weights[ib * ib_stride..ib * ib_stride + WEIGHT_BLOCK_LEN];
        for (quad, w_quad) in src_block
            .chunks_exact(WEIGHT_QUAD)
            .zip(block.chunks_exact(WEIGHT_BLOCK * WEIGHT_QUAD))
        {
            for (a, w) in acc.iter_mut().zip(w_quad.chunks_exact(WEIGHT_QUAD)) {
                let dot = quad
                    .iter()
                    .zip(w)
                    .fold(0i32, |s, (&x, &y)| s.wrapping_add(x as i32 * y as i32));
                *a = a.wrapping_add(dot);
            }
        }
    }
}
