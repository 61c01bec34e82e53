//! Operators: built once from bound buffers, executed many times.

mod builder;
mod fused_conv;

pub use builder::ConvBuilder;
pub use fused_conv::FusedConv;

use crate::conv::{ConvWindow, StageParams};
use crate::error::ConfigError;
use crate::tensor::Buffer;

/// An executable operator bound to its buffers.
pub trait Op: Send {
    fn name(&self) -> &'static str;

    /// Recomputes the outputs from the current contents of the bound inputs.
    ///
    /// Blocks until every output element is written. Never fails for an
    /// operator that was built successfully; bound buffers must not be
    /// locked by the caller while this runs.
    fn execute(&mut self);
}

/// Weights, optional bias and parameters of a fused 1x1 stage.
#[derive(Debug, Clone)]
pub struct Conv1x1Args<'a> {
    pub weights: &'a Buffer,
    pub bias: Option<&'a Buffer>,
    pub params: StageParams,
}

/// Builds a convolution operator, fused with a 1x1 stage when `conv1x1` is
/// given. Nothing runs until [`Op::execute`] is called.
///
/// Shorthand for [`ConvBuilder`] with the default thread count.
pub fn conv(
    src: &Buffer,
    weights: &Buffer,
    bias: Option<&Buffer>,
    dst: &Buffer,
    window: ConvWindow,
    params: StageParams,
    conv1x1: Option<Conv1x1Args<'_>>,
) -> Result<FusedConv, ConfigError> {
    let mut builder = ConvBuilder::new(src, weights, dst)
        .with_stride(window.strides)
        .with_padding(window.padding)
        .with_dilation(window.dilation)
        .with_conv0(params);
    if let Some(bias) = bias {
        builder = builder.with_bias(bias);
    }
    if let Some(c) = conv1x1 {
        builder = builder.with_conv1x1(c.weights, c.bias, c.params);
    }
    builder.build()
}
