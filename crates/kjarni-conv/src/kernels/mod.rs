//! Compute kernels for quantized convolution stages.
//!
//! A kernel is created once per [`KernelKey`] and computes one output tile
//! at a time: a run of `ow_block` output pixels of one output row, for one
//! block of `oc_block` output channels. It accumulates `u8 x s8` products
//! into the caller's workspace slice, then requantizes and stores the tile
//! into the destination chunk.
//!
//! Kernels are pure: they read the shared source, weights, bias and scales,
//! and write only their workspace slice and their destination chunk. Two
//! invocations with the same inputs produce identical bytes.

pub mod direct;
pub mod registry;
pub mod requant;
pub mod scalar;
#[cfg(target_arch = "x86_64")]
pub mod x86;

use std::fmt;

use crate::conv::{RoundMode, ScaleMode, StageConf, StageShape};
use crate::tensor::{BufferData, DType};

pub use direct::DirectConvKernel;
pub use registry::{clear_kernel_cache, kernel_cache_len, select_kernel};

/// Instruction set a kernel's inner loop is specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    Scalar,
    Avx2,
}

impl Isa {
    /// Best instruction set available on the running CPU.
    pub fn detect() -> Self {
        if Isa::Avx2.is_supported() {
            Isa::Avx2
        } else {
            Isa::Scalar
        }
    }

    pub fn is_supported(&self) -> bool {
        match self {
            Isa::Scalar => true,
            #[cfg(target_arch = "x86_64")]
            Isa::Avx2 => is_x86_feature_detected!("avx2"),
            #[cfg(not(target_arch = "x86_64"))]
            Isa::Avx2 => false,
        }
    }
}

/// Everything a kernel is specialized on. Two stages with equal keys can
/// share one kernel instance; scale values are passed at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub shape: StageShape,
    pub src_dt: DType,
    pub wei_dt: DType,
    pub bias_dt: DType,
    pub dst_dt: DType,
    pub round_mode: RoundMode,
    pub relu: bool,
    pub scale_mode: ScaleMode,
    pub oc_block: usize,
    pub ow_block: usize,
    /// Whether the stage belongs to a fused convolution.
    pub fused: bool,
    pub isa: Isa,
}

impl KernelKey {
    pub fn new(stage: &StageConf, fused: bool, isa: Isa) -> Self {
        Self {
            shape: stage.shape,
            src_dt: stage.src_dt,
            wei_dt: stage.wei_dt,
            bias_dt: stage.bias_dt,
            dst_dt: stage.dst_dt,
            round_mode: stage.round_mode,
            relu: stage.relu,
            scale_mode: stage.scale_mode(),
            oc_block: stage.oc_block,
            ow_block: stage.ow_block,
            fused,
            isa,
        }
    }
}

/// Origin of one output tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub n: usize,
    pub oh: usize,
    /// First output column.
    pub ow0: usize,
    /// First output channel.
    pub oc0: usize,
}

impl Tile {
    /// Tile origin of destination chunk `chunk`, where each chunk holds
    /// `ow_block` consecutive NHWC pixels with all their channels.
    pub fn from_chunk(chunk: usize, shape: &StageShape, ow_block: usize) -> Self {
        let per_row = shape.ow / ow_block;
        let row = chunk / per_row;
        Self {
            n: row / shape.oh,
            oh: row % shape.oh,
            ow0: (chunk % per_row) * ow_block,
            oc0: 0,
        }
    }

    pub fn with_oc0(self, oc0: usize) -> Self {
        Self { oc0, ..self }
    }
}

/// Bias of a stage, typed by its element kind.
#[derive(Debug, Clone, Copy)]
pub enum BiasSlice<'a> {
    None,
    S8(&'a [i8]),
    S32(&'a [i32]),
    F32(&'a [f32]),
}

impl<'a> BiasSlice<'a> {
    /// # Panics
    ///
    /// If the storage holds a kind that is not a valid bias.
    pub fn from_data(data: Option<&'a BufferData>) -> Self {
        match data {
            None => BiasSlice::None,
            Some(BufferData::S8(v)) => BiasSlice::S8(v),
            Some(BufferData::S32(v)) => BiasSlice::S32(v),
            Some(BufferData::F32(v)) => BiasSlice::F32(v),
            Some(other) => panic!("bias storage holds {}, which is not a bias kind", other.dtype()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            BiasSlice::None => DType::Undef,
            BiasSlice::S8(_) => DType::S8,
            BiasSlice::S32(_) => DType::S32,
            BiasSlice::F32(_) => DType::F32,
        }
    }
}

/// Mutable destination chunk, typed by its element kind.
#[derive(Debug)]
pub enum DstSliceMut<'a> {
    U8(&'a mut [u8]),
    S8(&'a mut [i8]),
    S32(&'a mut [i32]),
    F32(&'a mut [f32]),
}

impl DstSliceMut<'_> {
    pub fn dtype(&self) -> DType {
        match self {
            DstSliceMut::U8(_) => DType::U8,
            DstSliceMut::S8(_) => DType::S8,
            DstSliceMut::S32(_) => DType::S32,
            DstSliceMut::F32(_) => DType::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DstSliceMut::U8(v) => v.len(),
            DstSliceMut::S8(v) => v.len(),
            DstSliceMut::S32(v) => v.len(),
            DstSliceMut::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

macro_rules! impl_dst_from {
    ($ty:ty, $variant:ident) => {
        impl<'a> From<&'a mut [$ty]> for DstSliceMut<'a> {
            fn from(v: &'a mut [$ty]) -> Self {
                DstSliceMut::$variant(v)
            }
        }
    };
}

impl_dst_from!(u8, U8);
impl_dst_from!(i8, S8);
impl_dst_from!(i32, S32);
impl_dst_from!(f32, F32);

/// Read-only inputs of one stage.
#[derive(Debug, Clone, Copy)]
pub struct StageIo<'a> {
    /// Whole NHWC source of the stage.
    pub src: &'a [u8],
    /// Whole blocked weight tensor.
    pub weights: &'a [i8],
    pub bias: BiasSlice<'a>,
    /// One scale, or one per output channel.
    pub scales: &'a [f32],
}

/// A specialized unit computing output tiles of one convolution stage.
pub trait ComputeKernel: Send + Sync + fmt::Debug {
    fn key(&self) -> &KernelKey;

    /// Computes the tile starting at `tile` into `dst`.
    ///
    /// `dst` is the destination chunk containing the tile's pixels, laid out
    /// as `ow_block` pixels of `oc` channels each; only the tile's channel
    /// block is written. `ws` must hold at least `ow_block * oc_block`
    /// accumulators and is overwritten.
    fn compute_tile(
        &self,
        tile: &Tile,
        io: &StageIo<'_>,
        ws: &mut [i32],
        dst: &mut DstSliceMut<'_>,
    );
}

#[cfg(test)]
mod tests;
