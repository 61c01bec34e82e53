//! Unit tests for compute kernels.
//!
//! Micro-kernels are checked against a plain dot product; whole kernels are
//! driven tile by tile and compared with the reference convolution.

use std::sync::Arc;

use super::registry::{clear_kernel_cache, get_or_create_kernel, kernel_cache_len};
use super::*;
use crate::conv::{ConvParams, RoundMode, StageParams};
use crate::tensor::{Buffer, Layout};
use crate::tests::common::{generate_input, generate_weights, reference_conv, to_u8, RefBias};

// =============================================================================
// Test Helpers
// =============================================================================

fn stage_conf(p: &ConvParams, params: &StageParams, dst_dt: DType) -> StageConf {
    let shape = p.stage0();
    StageConf {
        shape,
        src_dt: DType::U8,
        wei_dt: DType::S8,
        bias_dt: DType::Undef,
        dst_dt,
        round_mode: params.round_mode,
        relu: params.relu,
        scales: params.scales.clone(),
        oc_block: crate::util::dividable_of(shape.oc_per_group(), &[64, 48, 32, 16]),
        ow_block: crate::util::find_dividable(shape.ow, 16),
    }
}

fn params_3x3() -> ConvParams {
    ConvParams {
        bs: 1,
        gp: 1,
        ic: 32,
        ih: 5,
        iw: 6,
        oc: 48,
        oh: 5,
        ow: 6,
        kh: 3,
        kw: 3,
        ph: 1,
        pw: 1,
        sh: 1,
        sw: 1,
        oc1x1: 0,
        dh: 0,
        dw: 0,
    }
}

/// Runs every tile of a stage sequentially.
fn run_tiles(kernel: &dyn ComputeKernel, stage: &StageConf, io: &StageIo<'_>, dst: &mut [u8]) {
    let mut ws = vec![0i32; stage.ws_per_thread()];
    for (chunk, out) in dst.chunks_mut(stage.chunk_len()).enumerate() {
        let tile = Tile::from_chunk(chunk, &stage.shape, stage.ow_block);
        let mut out = DstSliceMut::from(out);
        for ob in 0..stage.num_oc_blocks() {
            kernel.compute_tile(&tile.with_oc0(ob * stage.oc_block), io, &mut ws, &mut out);
        }
    }
}

fn naive_pixel(src: &[u8], weights: &ndarray::Array4<i8>, ob: usize) -> Vec<i32> {
    (0..16)
        .map(|o| {
            src.iter()
                .enumerate()
                .map(|(i, &s)| s as i32 * weights[[ob * 16 + o, i, 0, 0]] as i32)
                .sum()
        })
        .collect()
}

// =============================================================================
// Micro-kernels
// =============================================================================

#[test]
fn test_scalar_pixel_matches_dot_product() {
    let weights = generate_weights([32, 64, 1, 1], 100, 3);
    let blocked = Buffer::from_array(weights.view(), Layout::OIhw4i16o4i).unwrap();
    let w = blocked.to_vec::<i8>().unwrap();
    let src: Vec<u8> = (0..64).map(|i| (i * 37 % 256) as u8).collect();

    for ob in 0..2 {
        let mut acc = vec![5i32; 16];
        // 1x1 kernel: input blocks are 256 bytes apart, output blocks 4 * 256
        scalar::accumulate_pixel(&src, &w[ob * 4 * 256..], 256, &mut acc);
        let expected: Vec<i32> = naive_pixel(&src, &weights, ob).iter().map(|v| v + 5).collect();
        assert_eq!(acc, expected, "output block {}", ob);
    }
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_avx2_pixel_matches_scalar() {
    if !is_x86_feature_detected!("avx2") {
        println!("Skipping AVX2 test: CPU does not support it");
        return;
    }
    // extremes exercise the i16 widening path
    let mut weights = generate_weights([16, 48, 3, 3], 127, 11);
    weights.slice_mut(ndarray::s![0, .., .., ..]).fill(-128);
    weights.slice_mut(ndarray::s![1, .., .., ..]).fill(127);
    let blocked = Buffer::from_array(weights.view(), Layout::OIhw4i16o4i).unwrap();
    let w = blocked.to_vec::<i8>().unwrap();
    let mut src: Vec<u8> = (0..48).map(|i| (i * 53 % 256) as u8).collect();
    src[0] = 255;
    src[47] = 255;

    let ib_stride = 9 * 256;
    for tap in 0..9 {
        let mut expected = vec![-3i32; 16];
        let mut actual = expected.clone();
        scalar::accumulate_pixel(&src, &w[tap * 256..], ib_stride, &mut expected);
        unsafe { x86::accumulate_pixel_avx2(&src, &w[tap * 256..], ib_stride, &mut actual) };
        assert_eq!(actual, expected, "tap {}", tap);
    }
}

// =============================================================================
// Tiles
// =============================================================================

#[test]
fn test_tile_from_chunk() {
    let p = ConvParams {
        bs: 2,
        oh: 3,
        ow: 8,
        ..params_3x3()
    };
    let shape = p.stage0();
    assert_eq!(
        Tile::from_chunk(0, &shape, 4),
        Tile { n: 0, oh: 0, ow0: 0, oc0: 0 }
    );
    assert_eq!(
        Tile::from_chunk(3, &shape, 4),
        Tile { n: 0, oh: 1, ow0: 4, oc0: 0 }
    );
    assert_eq!(
        Tile::from_chunk(7, &shape, 4),
        Tile { n: 1, oh: 0, ow0: 4, oc0: 0 }
    );
    assert_eq!(Tile::from_chunk(7, &shape, 4).with_oc0(32).oc0, 32);
}

// =============================================================================
// Direct kernel
// =============================================================================

#[test]
fn test_direct_kernel_matches_reference() {
    let p = params_3x3();
    let params = StageParams::new(vec![0.05]).with_relu(true);
    let stage = stage_conf(&p, &params, DType::U8);
    assert_eq!((stage.oc_block, stage.ow_block), (48, 6));

    let src = generate_input(p.src_dims(), 15, 1);
    let weights = generate_weights(p.weights_dims(), 8, 2);
    let src_buf = Buffer::from_array(src.view(), Layout::Nhwc).unwrap();
    let wei_buf = Buffer::from_array(weights.view(), Layout::OIhw4i16o4i).unwrap();
    let src_raw = src_buf.to_vec::<u8>().unwrap();
    let wei_raw = wei_buf.to_vec::<i8>().unwrap();

    let io = StageIo {
        src: &src_raw,
        weights: &wei_raw,
        bias: BiasSlice::None,
        scales: &params.scales,
    };
    for isa in [Isa::Scalar, Isa::detect()] {
        let kernel = DirectConvKernel::new(KernelKey::new(&stage, false, isa));
        let mut dst = vec![0u8; p.dst_dims().iter().product()];
        run_tiles(&kernel, &stage, &io, &mut dst);

        let dst_buf = Buffer::nhwc(p.dst_dims(), DType::U8).unwrap();
        dst_buf.fill_with(|i| dst[i]).unwrap();
        let expected = to_u8(
            &reference_conv(&src, &weights, &RefBias::None, [1, 1], [1, 1], &params),
            RoundMode::Nearest,
        );
        assert_eq!(dst_buf.to_array::<u8>().unwrap(), expected, "{:?}", isa);
    }
}

#[test]
fn test_direct_kernel_writes_only_its_channel_block() {
    let p = ConvParams {
        oc: 64,
        ..params_3x3()
    };
    let params = StageParams::default();
    let mut stage = stage_conf(&p, &params, DType::U8);
    stage.oc_block = 16;

    let src_raw = vec![1u8; p.src_dims().iter().product()];
    let wei_raw = vec![1i8; Layout::OIhw4i16o4i.physical_len(&p.weights_dims())];
    let io = StageIo {
        src: &src_raw,
        weights: &wei_raw,
        bias: BiasSlice::None,
        scales: &params.scales,
    };
    let kernel = DirectConvKernel::new(KernelKey::new(&stage, false, Isa::Scalar));
    let mut chunk = vec![7u8; stage.chunk_len()];
    let mut ws = vec![0i32; stage.ws_per_thread()];
    let tile = Tile::from_chunk(0, &stage.shape, stage.ow_block).with_oc0(16);
    kernel.compute_tile(&tile, &io, &mut ws, &mut DstSliceMut::from(chunk.as_mut_slice()));

    for (i, &v) in chunk.iter().enumerate() {
        let oc = i % 64;
        if (16..32).contains(&oc) {
            assert_ne!(v, 7, "element {} not written", i);
        } else {
            assert_eq!(v, 7, "element {} outside the tile was written", i);
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

#[test]
fn test_registry_reuses_kernels() {
    let p = params_3x3();
    let stage = stage_conf(&p, &StageParams::new(vec![0.5]), DType::U8);

    let a = select_kernel(&stage, false);
    let b = select_kernel(&stage, false);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.key().isa, Isa::detect());

    let relu = StageConf {
        relu: true,
        ..stage.clone()
    };
    let c = select_kernel(&relu, false);
    assert!(!Arc::ptr_eq(&a, &c));
    assert!(c.key().relu);
    assert!(kernel_cache_len() >= 2);

    // live kernels survive a cache clear
    clear_kernel_cache();
    assert_eq!(a.key(), b.key());
    let d = get_or_create_kernel(*a.key());
    assert_eq!(d.key(), a.key());
}

#[test]
fn test_unused_kernels_are_freed() {
    let p = ConvParams {
        ih: 7,
        iw: 9,
        oh: 7,
        ow: 9,
        ..params_3x3()
    };
    let stage = stage_conf(&p, &StageParams::new(vec![0.5]).with_relu(true), DType::S32);

    let kernel = select_kernel(&stage, true);
    let again = select_kernel(&stage, true);
    assert!(Arc::ptr_eq(&kernel, &again));
    assert!(kernel_cache_len() >= 1);

    let weak = Arc::downgrade(&kernel);
    drop(kernel);
    assert!(weak.upgrade().is_some());
    drop(again);
    assert!(weak.upgrade().is_none());

    let fresh = select_kernel(&stage, true);
    assert_eq!(fresh.key().dst_dt, DType::S32);
}

#[test]
fn test_bias_slice_kinds() {
    assert_eq!(BiasSlice::from_data(None).dtype(), DType::Undef);
    let s8 = BufferData::S8(vec![1, -2]);
    assert_eq!(BiasSlice::from_data(Some(&s8)).dtype(), DType::S8);
    let s32 = BufferData::S32(vec![7]);
    assert_eq!(BiasSlice::from_data(Some(&s32)).dtype(), DType::S32);
    let f32 = BufferData::F32(vec![0.5]);
    assert_eq!(BiasSlice::from_data(Some(&f32)).dtype(), DType::F32);
}

#[test]
#[should_panic(expected = "not a bias kind")]
fn test_u8_bias_storage_is_fatal() {
    let u8 = BufferData::U8(vec![1]);
    let _ = BiasSlice::from_data(Some(&u8));
}

#[test]
fn test_scale_values_are_not_part_of_the_key() {
    let p = params_3x3();
    let a = stage_conf(&p, &StageParams::new(vec![0.5]), DType::U8);
    let b = stage_conf(&p, &StageParams::new(vec![0.25]), DType::U8);
    let c = stage_conf(&p, &StageParams::new(vec![0.25; 48]), DType::U8);
    let key = |s: &StageConf| KernelKey::new(s, false, Isa::Scalar);
    assert_eq!(key(&a), key(&b));
    assert_ne!(key(&a), key(&c));
    assert_ne!(key(&a), KernelKey::new(&a, true, Isa::Scalar));
}
