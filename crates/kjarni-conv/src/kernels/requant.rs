//! Requantization of s32 accumulators into the destination domain.
//!
//! Per element: `acc (+ bias) -> relu -> * scale -> round -> saturate`.
//! Integer biases are added in the accumulator domain, float biases after
//! conversion to f32. Rounding and saturation only apply to integral kinds.

use crate::conv::RoundMode;

use super::{BiasSlice, DstSliceMut};

/// Bias, activation and scale applied to one accumulator of channel `oc`.
#[inline(always)]
pub fn scale_value(acc: i32, bias: BiasSlice<'_>, oc: usize, relu: bool, scale: f32) -> f32 {
    let v = match bias {
        BiasSlice::None => acc as f32,
        BiasSlice::S8(b) => acc.wrapping_add(b[oc] as i32) as f32,
        BiasSlice::S32(b) => acc.wrapping_add(b[oc]) as f32,
        BiasSlice::F32(b) => acc as f32 + b[oc],
    };
    let v = if relu { v.max(0.0) } else { v };
    v * scale
}

impl DstSliceMut<'_> {
    /// Rounds, saturates and stores `v` at `idx`.
    #[inline(always)]
    pub fn store(&mut self, idx: usize, v: f32, round_mode: RoundMode) {
        match self {
            DstSliceMut::U8(d) => d[idx] = round_mode.apply(v).clamp(0.0, u8::MAX as f32) as u8,
            DstSliceMut::S8(d) => {
                d[idx] = round_mode.apply(v).clamp(i8::MIN as f32, i8::MAX as f32) as i8
            }
            // float to int `as` saturates at the i32 range
            DstSliceMut::S32(d) => d[idx] = round_mode.apply(v) as i32,
            DstSliceMut::F32(d) => d[idx] = v,
        }
    }
}
