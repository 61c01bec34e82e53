//! Direct convolution kernel over blocked weights.

use crate::conv::ScaleMode;
use crate::tensor::layout::{WEIGHT_BLOCK, WEIGHT_BLOCK_LEN};

use super::requant::scale_value;
use super::{scalar, ComputeKernel, DstSliceMut, Isa, KernelKey, StageIo, Tile};

/// Computes a tile by walking the receptive field of each output pixel and
/// feeding every in-bounds source pixel to a 16-channel micro-kernel.
/// Padded positions are skipped; they contribute zero.
#[derive(Debug)]
pub struct DirectConvKernel {
    key: KernelKey,
    /// Weight bytes between consecutive input channel blocks.
    ib_stride: usize,
    /// Weight bytes between consecutive output channel blocks.
    ob_stride: usize,
}

impl DirectConvKernel {
    /// # Panics
    ///
    /// If `key` asks for an instruction set the CPU does not support.
    pub fn new(key: KernelKey) -> Self {
        assert!(
            key.isa.is_supported(),
            "kernel requested for {:?}, which this CPU does not support",
            key.isa
        );
        let s = &key.shape;
        let ib_stride = s.kh * s.kw * WEIGHT_BLOCK_LEN;
        let ob_stride = (s.ic_per_group() / WEIGHT_BLOCK) * ib_stride;
        Self {
            key,
            ib_stride,
            ob_stride,
        }
    }

    #[inline(always)]
    fn accumulate(&self, src: &[u8], weights: &[i8], acc: &mut [i32]) {
        match self.key.isa {
            // SAFETY: `new` checked that the CPU supports AVX2.
            #[cfg(target_arch = "x86_64")]
            Isa::Avx2 => unsafe {
                super::x86::accumulate_pixel_avx2(src, weights, self.ib_stride, acc)
            },
            _ => scalar::accumulate_pixel(src, weights, self.ib_stride, acc),
        }
    }
}

impl ComputeKernel for DirectConvKernel {
    fn key(&self) -> &KernelKey {
        &self.key
    }

    fn compute_tile(
        &self,
        tile: &Tile,
        io: &StageIo<'_>,
        ws: &mut [i32],
        dst: &mut DstSliceMut<'_>,
    ) {
        let k = &self.key;
        let s = &k.shape;
        let (oc_block, ow_block) = (k.oc_block, k.ow_block);
        assert!(
            ws.len() >= oc_block * ow_block,
            "workspace slice holds {} accumulators, tile needs {}",
            ws.len(),
            oc_block * ow_block
        );
        let ws = &mut ws[..oc_block * ow_block];
        ws.fill(0);

        let icg = s.ic_per_group();
        let src_c0 = (tile.oc0 / s.oc_per_group()) * icg;
        let ob0 = tile.oc0 / WEIGHT_BLOCK;

        // =====================================================================
        // Accumulate
        // =====================================================================
        for (j, acc) in ws.chunks_exact_mut(oc_block).enumerate() {
            let ow = tile.ow0 + j;
            for kh in 0..s.kh {
                let Some(ih) = (tile.oh * s.sh + kh).checked_sub(s.ph).filter(|&h| h < s.ih) else {
                    continue;
                };
                for kw in 0..s.kw {
                    let Some(iw) = (ow * s.sw + kw).checked_sub(s.pw).filter(|&w| w < s.iw) else {
                        continue;
                    };
                    let px = ((tile.n * s.ih + ih) * s.iw + iw) * s.ic + src_c0;
                    let src = &io.src[px..px + icg];
                    let tap = (kh * s.kw + kw) * WEIGHT_BLOCK_LEN;
                    for (ob, acc16) in acc.chunks_exact_mut(WEIGHT_BLOCK).enumerate() {
                        let w0 = (ob0 + ob) * self.ob_stride + tap;
                        self.accumulate(src, &io.weights[w0..], acc16);
                    }
                }
            }
        }

        // =====================================================================
        // Requantize and store
        // =====================================================================
        for (j, acc) in ws.chunks_exact(oc_block).enumerate() {
            for (c, &a) in acc.iter().enumerate() {
                let oc = tile.oc0 + c;
                let scale = match k.scale_mode {
                    ScaleMode::Uniform => io.scales[0],
                    ScaleMode::PerChannel => io.scales[oc],
                };
                let v = scale_value(a, io.bias, oc, k.relu, scale);
                dst.store(j * s.oc + oc, v, k.round_mode);
            }
        }
    }
}
