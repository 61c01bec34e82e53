#![allow(unsafe_code)]
use std::arch::x86_64::*;

use crate::tensor::layout::{WEIGHT_BLOCK, WEIGHT_BLOCK_LEN, WEIGHT_QUAD};

/// AVX2 version of [`accumulate_pixel`](crate::kernels::scalar::accumulate_pixel).
///
/// Each input quad is widened to i16 and broadcast; each group of four output
/// channels is widened from 16 weight bytes and multiplied with `madd`, which
/// leaves two partial sums per channel. A horizontal add and a lane permute
/// fold those into 16 ordered channel sums at the end.
///
/// # Safety
///
/// The CPU must support AVX2. `src.len()` must be a multiple of 16,
/// `weights` must hold a full block at every `ib_stride` step, and `acc` must
/// hold at least 16 values.
#[target_feature(enable = "avx2")]
pub unsafe fn accumulate_pixel_avx2(src: &[u8], weights: &[i8], ib_stride: usize, acc: &mut [i32]) {
    debug_assert!(acc.len() >= WEIGHT_BLOCK);
    unsafe {
        // acc_r holds (oc 4r .. 4r+3) x (two partial sums)
        let mut acc0 = _mm256_setzero_si256();
        let mut acc1 = _mm256_setzero_si256();
        let mut acc2 = _mm256_setzero_si256();
        let mut acc3 = _mm256_setzero_si256();

        for (ib, src_block) in src.chunks_exact(WEIGHT_BLOCK).enumerate() {
            let block = &weights[ib * ib_stride..ib * ib_stride + WEIGHT_BLOCK_LEN];
            for (q, quad) in src_block.chunks_exact(WEIGHT_QUAD).enumerate() {
                let packed = u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]) as i32;
                let s = _mm256_broadcastq_epi64(_mm_cvtepu8_epi16(_mm_cvtsi32_si128(packed)));

                let w_ptr = block.as_ptr().add(q * WEIGHT_BLOCK * WEIGHT_QUAD) as *const __m128i;
                let w0 = _mm256_cvtepi8_epi16(_mm_loadu_si128(w_ptr));
                let w1 = _mm256_cvtepi8_epi16(_mm_loadu_si128(w_ptr.add(1)));
                let w2 = _mm256_cvtepi8_epi16(_mm_loadu_si128(w_ptr.add(2)));
                let w3 = _mm256_cvtepi8_epi16(_mm_loadu_si128(w_ptr.add(3)));

                acc0 = _mm256_add_epi32(acc0, _mm256_madd_epi16(w0, s));
                acc1 = _mm256_add_epi32(acc1, _mm256_madd_epi16(w1, s));
                acc2 = _mm256_add_epi32(acc2, _mm256_madd_epi16(w2, s));
                acc3 = _mm256_add_epi32(acc3, _mm256_madd_epi16(w3, s));
            }
        }

        // hadd yields [0 1 4 5 | 2 3 6 7]; 0xD8 swaps the middle quadwords
        let lo = _mm256_permute4x64_epi64(_mm256_hadd_epi32(acc0, acc1), 0xD8);
        let hi = _mm256_permute4x64_epi64(_mm256_hadd_epi32(acc2, acc3), 0xD8);

        let out = acc.as_mut_ptr() as *mut __m256i;
        _mm256_storeu_si256(out, _mm256_add_epi32(_mm256_loadu_si256(out), lo));
        _mm256_storeu_si256(out.add(1), _mm256_add_epi32(_mm256_loadu_si256(out.add(1)), hi));
    }
}
