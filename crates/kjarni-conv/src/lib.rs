//! Kjarni Conv: fused quantized convolution operators for CPU inference.
//!
//! A k x k convolution over u8 activations and s8 weights, optionally fused
//! with a trailing 1x1 convolution, with bias, requantization and ReLU
//! applied per stage. Operators are validated once when built and then
//! executed repeatedly without allocating.

pub mod conv;
pub mod error;
pub mod kernels;
pub mod op;
pub mod tensor;
pub mod util;
pub mod workspace;

// Re-export commonly used items
pub use crate::{
    conv::{ConvConf, ConvParams, ConvWindow, RoundMode, StageParams},
    error::ConfigError,
    op::{conv, Conv1x1Args, ConvBuilder, FusedConv, Op},
    tensor::{Buffer, DType, Layout},
};

#[cfg(test)]
pub mod tests;
