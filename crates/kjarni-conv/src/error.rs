//! Configuration errors for convolution operators.
//!
//! Every rejection happens once, when an operator is constructed. Execution
//! never returns an error; it assumes a configuration that was accepted here.

use thiserror::Error;

use crate::tensor::{DType, Layout};

/// Reasons an operator configuration can be rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A bound buffer has the wrong number of dimensions for its role.
    #[error("{role}: expected {expected} dimensions, got {actual}")]
    InvalidRank {
        role: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A bound buffer has a zero-sized dimension.
    #[error("{role}: dimensions {dims:?} contain a zero")]
    ZeroDim { role: &'static str, dims: Vec<usize> },

    /// A bound buffer's element kind is not allowed for its role.
    #[error("{role}: element kind {dtype} is not supported, expected one of {allowed}")]
    InvalidDType {
        role: &'static str,
        dtype: DType,
        allowed: &'static str,
    },

    /// A bound buffer's physical layout is not allowed for its role.
    #[error("{role}: layout {actual:?} is not supported, expected {expected:?}")]
    InvalidLayout {
        role: &'static str,
        expected: Layout,
        actual: Layout,
    },

    /// Stride must be at least 1 in both spatial directions.
    #[error("stride must be non-zero, got {0:?}")]
    ZeroStride([usize; 2]),

    /// Dilation is reserved and must be zero.
    #[error("dilation is not supported, got {0:?}")]
    UnsupportedDilation([usize; 2]),

    /// The kernel window does not fit into the padded input.
    #[error("{axis}: kernel {kernel} does not fit input {input} with padding {padding}")]
    KernelTooLarge {
        axis: &'static str,
        input: usize,
        kernel: usize,
        padding: usize,
    },

    /// Source and weight channels do not describe an integral group count.
    #[error("group count is not integral: src channels {src_ic}, weight input channels {wei_ic}, output channels {oc}")]
    GroupMismatch { src_ic: usize, wei_ic: usize, oc: usize },

    /// A channel count is not a multiple of the blocked weight layout width.
    #[error("{role}: {channels} channels is not a multiple of {block}")]
    UnblockedChannels {
        role: &'static str,
        channels: usize,
        block: usize,
    },

    /// A dimension disagrees with the value implied by the other buffers.
    #[error("{role}: {dim} is {actual}, expected {expected}")]
    DimMismatch {
        role: &'static str,
        dim: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The fused stage must use a 1x1 kernel.
    #[error("fused weights must be 1x1, got {kh}x{kw}")]
    NotPointwise { kh: usize, kw: usize },

    /// Scale vector length is neither 1 nor the stage's output channels.
    #[error("conv{stage} scales: length {actual} must be 1 or {channels}")]
    ScaleLength {
        stage: usize,
        actual: usize,
        channels: usize,
    },

    /// A scale is negative, NaN or infinite.
    #[error("conv{stage} scales: value {value} at {index} must be finite and non-negative")]
    InvalidScale { stage: usize, index: usize, value: f32 },

    /// The destination shares storage with an input buffer.
    #[error("{dst} shares storage with {input}")]
    AliasedBuffers {
        dst: &'static str,
        input: &'static str,
    },

    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
