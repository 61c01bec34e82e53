// Shared by the unit tests of every module, not compiled into the library.
#![allow(dead_code)]

use ndarray::Array4;

use crate::conv::{RoundMode, StageParams};

/// Cheap deterministic hash of an index, for reproducible test data.
fn mix(i: usize, seed: usize) -> usize {
    let x = i
        .wrapping_mul(2_654_435_761)
        .wrapping_add(seed.wrapping_mul(40_503))
        .wrapping_add(seed);
    x ^ (x >> 13)
}

/// Source activations in `0..=max`.
pub fn generate_input(dims: [usize; 4], max: u8, seed: usize) -> Array4<u8> {
    let mut i = 0;
    Array4::from_shape_fn((dims[0], dims[1], dims[2], dims[3]), |_| {
        i += 1;
        (mix(i, seed) % (max as usize + 1)) as u8
    })
}

/// Weights in `-range..=range`.
pub fn generate_weights(dims: [usize; 4], range: i32, seed: usize) -> Array4<i8> {
    let span = 2 * range as usize + 1;
    let mut i = 0;
    Array4::from_shape_fn((dims[0], dims[1], dims[2], dims[3]), |_| {
        i += 1;
        ((mix(i, seed) % span) as i32 - range) as i8
    })
}

/// Bias of a reference stage.
#[derive(Debug, Clone)]
pub enum RefBias {
    None,
    S8(Vec<i8>),
    S32(Vec<i32>),
    F32(Vec<f32>),
}

/// Naive quantized convolution on logically ordered arrays.
///
/// Returns the scaled values before rounding and saturation, computed in
/// the same arithmetic order as the operator.
pub fn reference_conv(
    src: &Array4<u8>,
    weights: &Array4<i8>,
    bias: &RefBias,
    strides: [usize; 2],
    padding: [usize; 2],
    params: &StageParams,
) -> Array4<f32> {
    let (bs, ic, ih, iw) = src.dim();
    let (oc, icg, kh, kw) = weights.dim();
    let groups = ic / icg;
    let ocg = oc / groups;
    let oh = (ih + 2 * padding[0] - kh) / strides[0] + 1;
    let ow = (iw + 2 * padding[1] - kw) / strides[1] + 1;

    Array4::from_shape_fn((bs, oc, oh, ow), |(n, o, y, x)| {
        let g = o / ocg;
        let mut acc = 0i32;
        for i in 0..icg {
            for r in 0..kh {
                for s in 0..kw {
                    let sy = (y * strides[0] + r) as isize - padding[0] as isize;
                    let sx = (x * strides[1] + s) as isize - padding[1] as isize;
                    if sy < 0 || sx < 0 || sy >= ih as isize || sx >= iw as isize {
                        continue;
                    }
                    let a = src[[n, g * icg + i, sy as usize, sx as usize]] as i32;
                    let w = weights[[o, i, r, s]] as i32;
                    acc = acc.wrapping_add(a * w);
                }
            }
        }
        let v = match bias {
            RefBias::None => acc as f32,
            RefBias::S8(b) => acc.wrapping_add(b[o] as i32) as f32,
            RefBias::S32(b) => acc.wrapping_add(b[o]) as f32,
            RefBias::F32(b) => acc as f32 + b[o],
        };
        let v = if params.relu { v.max(0.0) } else { v };
        let scale = if params.scales.len() == 1 {
            params.scales[0]
        } else {
            params.scales[o]
        };
        v * scale
    })
}

pub fn to_u8(values: &Array4<f32>, round: RoundMode) -> Array4<u8> {
    values.mapv(|v| round.apply(v).clamp(0.0, 255.0) as u8)
}

pub fn to_s8(values: &Array4<f32>, round: RoundMode) -> Array4<i8> {
    values.mapv(|v| round.apply(v).clamp(-128.0, 127.0) as i8)
}

pub fn to_s32(values: &Array4<f32>, round: RoundMode) -> Array4<i32> {
    values.mapv(|v| round.apply(v) as i32)
}
