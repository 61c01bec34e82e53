//! Kernel configuration: derivation and validation of a convolution setup.
//!
//! [`ConvConf::init`] is the only place where a configuration is checked.
//! It reads shapes, layouts and element kinds from the bound buffers'
//! descriptors, derives the shape descriptor and the tile geometry of each
//! stage, and rejects anything the compute kernels cannot run. An accepted
//! [`ConvConf`] is immutable and is trusted by everything downstream.

use crate::conv::params::{ConvParams, RoundMode, StageParams, StageShape};
use crate::error::ConfigError;
use crate::tensor::{DType, Layout, MemoryDesc, WEIGHT_BLOCK};
use crate::util::{conv_output_size, dividable_of, find_dividable};

/// Preferred output channel block widths, largest first.
pub const OC_BLOCK_CANDIDATES: [usize; 4] = [64, 48, 32, 16];

/// Upper bound on the number of output columns per spatial tile.
pub const MAX_OW_BLOCK: usize = 16;

/// Descriptors of every buffer bound to a convolution.
#[derive(Debug, Clone, Copy)]
pub struct ConvDescs<'a> {
    pub src: &'a MemoryDesc,
    pub weights: &'a MemoryDesc,
    pub bias: Option<&'a MemoryDesc>,
    /// Destination of the last stage.
    pub dst: &'a MemoryDesc,
    pub conv1x1: Option<Conv1x1Descs<'a>>,
}

/// Buffers and parameters of the fused 1x1 stage.
#[derive(Debug, Clone, Copy)]
pub struct Conv1x1Descs<'a> {
    pub weights: &'a MemoryDesc,
    pub bias: Option<&'a MemoryDesc>,
    pub params: &'a StageParams,
}

/// Sliding-window settings of the first stage, `[height, width]` each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvWindow {
    pub strides: [usize; 2],
    pub padding: [usize; 2],
    /// Zero-based dilation; only 0 is supported.
    pub dilation: [usize; 2],
}

impl Default for ConvWindow {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            padding: [0, 0],
            dilation: [0, 0],
        }
    }
}

/// Whether a stage applies one scale to every channel or one per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaleMode {
    Uniform,
    PerChannel,
}

/// Fully resolved configuration of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConf {
    pub shape: StageShape,
    pub src_dt: DType,
    pub wei_dt: DType,
    /// `Undef` when the stage has no bias.
    pub bias_dt: DType,
    pub dst_dt: DType,
    pub round_mode: RoundMode,
    pub relu: bool,
    pub scales: Vec<f32>,
    /// Output channels computed per tile.
    pub oc_block: usize,
    /// Output columns computed per tile.
    pub ow_block: usize,
}

impl StageConf {
    pub fn scale_mode(&self) -> ScaleMode {
        if self.scales.len() == 1 {
            ScaleMode::Uniform
        } else {
            ScaleMode::PerChannel
        }
    }

    pub fn has_bias(&self) -> bool {
        self.bias_dt != DType::Undef
    }

    /// Accumulator slots one worker needs for a tile.
    pub fn ws_per_thread(&self) -> usize {
        self.ow_block * self.oc_block
    }

    /// Number of destination elements one spatial tile covers, across all
    /// output channels.
    pub fn chunk_len(&self) -> usize {
        self.ow_block * self.shape.oc
    }

    pub fn num_oc_blocks(&self) -> usize {
        self.shape.oc / self.oc_block
    }
}

/// Complete, validated configuration of a (possibly fused) convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvConf {
    pub params: ConvParams,
    pub conv0: StageConf,
    pub conv1: Option<StageConf>,
}

impl ConvConf {
    pub fn is_fused(&self) -> bool {
        self.conv1.is_some()
    }

    /// The stage that writes the caller's destination.
    pub fn last_stage(&self) -> &StageConf {
        self.conv1.as_ref().unwrap_or(&self.conv0)
    }

    /// Derives and validates a configuration from the bound buffers.
    ///
    /// Checks run in a fixed order and the first failing one is reported.
    pub fn init(
        descs: &ConvDescs<'_>,
        window: &ConvWindow,
        conv0: &StageParams,
    ) -> Result<Self, ConfigError> {
        let result = Self::validate(descs, window, conv0);
        if let Err(e) = &result {
            log::warn!("Rejected convolution configuration: {}", e);
        }
        result
    }

    fn validate(
        descs: &ConvDescs<'_>,
        window: &ConvWindow,
        conv0: &StageParams,
    ) -> Result<Self, ConfigError> {
        // =====================================================================
        // Buffer structure
        // =====================================================================
        check_desc(descs.src, "src", Layout::Nhwc, &[DType::U8], "u8")?;
        check_desc(
            descs.weights,
            "weights",
            Layout::OIhw4i16o4i,
            &[DType::S8],
            "s8",
        )?;
        check_structure(descs.dst, "dst", Layout::Nhwc)?;

        let [bs, ic, ih, iw] = dims4(descs.src);
        let [oc, wei_ic, kh, kw] = dims4(descs.weights);
        let [dst_bs, dst_oc, oh, ow] = dims4(descs.dst);

        // =====================================================================
        // Window
        // =====================================================================
        if window.strides.contains(&0) {
            return Err(ConfigError::ZeroStride(window.strides));
        }
        if window.dilation != [0, 0] {
            return Err(ConfigError::UnsupportedDilation(window.dilation));
        }
        let [sh, sw] = window.strides;
        let [ph, pw] = window.padding;

        // =====================================================================
        // Groups and channel blocking
        // =====================================================================
        if ic % wei_ic != 0 || oc % (ic / wei_ic) != 0 {
            return Err(ConfigError::GroupMismatch {
                src_ic: ic,
                wei_ic,
                oc,
            });
        }
        let gp = ic / wei_ic;
        check_blocked("weights input channels", wei_ic)?;
        check_blocked("weights output channels per group", oc / gp)?;

        // =====================================================================
        // Output size
        // =====================================================================
        let exp_oh = conv_output_size(ih, kh, sh, ph, 0).ok_or(ConfigError::KernelTooLarge {
            axis: "height",
            input: ih,
            kernel: kh,
            padding: ph,
        })?;
        let exp_ow = conv_output_size(iw, kw, sw, pw, 0).ok_or(ConfigError::KernelTooLarge {
            axis: "width",
            input: iw,
            kernel: kw,
            padding: pw,
        })?;
        check_dim("dst", "height", exp_oh, oh)?;
        check_dim("dst", "width", exp_ow, ow)?;
        check_dim("dst", "batch", bs, dst_bs)?;

        let oc1x1 = match &descs.conv1x1 {
            Some(fused) => {
                check_structure(fused.weights, "weights1x1", Layout::OIhw4i16o4i)?;
                fused.weights.dims[0]
            }
            None => 0,
        };
        let expected_dst_oc = if oc1x1 > 0 { oc1x1 } else { oc };
        check_dim("dst", "channels", expected_dst_oc, dst_oc)?;

        let params = ConvParams {
            bs,
            gp,
            ic,
            ih,
            iw,
            oc,
            oh,
            ow,
            kh,
            kw,
            ph,
            pw,
            sh,
            sw,
            oc1x1,
            dh: 0,
            dw: 0,
        };

        // =====================================================================
        // Destination kind
        // =====================================================================
        // The stage-0 result of a fused convolution is always held as u8.
        let dst_dt = check_dtype(descs.dst, "dst", &DST_KINDS, DST_KINDS_NAMES)?;
        let dst0_dt = if descs.conv1x1.is_some() { DType::U8 } else { dst_dt };

        // =====================================================================
        // Stage 0 bias and scales
        // =====================================================================
        let bias0_dt = check_bias(descs.bias, "bias", oc)?;
        check_scales(0, &conv0.scales, oc)?;

        let shape0 = params.stage0();
        let stage0 = StageConf {
            shape: shape0,
            src_dt: DType::U8,
            wei_dt: DType::S8,
            bias_dt: bias0_dt,
            dst_dt: dst0_dt,
            round_mode: conv0.round_mode,
            relu: conv0.relu,
            scales: conv0.scales.clone(),
            oc_block: dividable_of(shape0.oc_per_group(), &OC_BLOCK_CANDIDATES),
            ow_block: find_dividable(ow, MAX_OW_BLOCK),
        };

        // =====================================================================
        // Fused 1x1 stage
        // =====================================================================
        let stage1 = match &descs.conv1x1 {
            None => None,
            Some(fused) => {
                check_dtype(fused.weights, "weights1x1", &[DType::S8], "s8")?;
                let [o1, i1, kh1, kw1] = dims4(fused.weights);
                if (kh1, kw1) != (1, 1) {
                    return Err(ConfigError::NotPointwise { kh: kh1, kw: kw1 });
                }
                check_dim("weights1x1", "input channels", oc, i1)?;
                check_blocked("weights1x1 output channels", o1)?;
                let bias1_dt = check_bias(fused.bias, "bias1x1", o1)?;
                check_scales(1, &fused.params.scales, o1)?;

                let shape1 = params.conv1x1().stage0();
                Some(StageConf {
                    shape: shape1,
                    src_dt: DType::U8,
                    wei_dt: DType::S8,
                    bias_dt: bias1_dt,
                    dst_dt,
                    round_mode: fused.params.round_mode,
                    relu: fused.params.relu,
                    scales: fused.params.scales.clone(),
                    oc_block: dividable_of(shape1.oc_per_group(), &OC_BLOCK_CANDIDATES),
                    ow_block: find_dividable(ow, MAX_OW_BLOCK),
                })
            }
        };

        log::debug!(
            "Tile geometry: conv0 oc_block={} ow_block={}{}",
            stage0.oc_block,
            stage0.ow_block,
            stage1
                .as_ref()
                .map(|s| format!(", conv1 oc_block={} ow_block={}", s.oc_block, s.ow_block))
                .unwrap_or_default()
        );

        Ok(Self {
            params,
            conv0: stage0,
            conv1: stage1,
        })
    }
}

const DST_KINDS: [DType; 4] = [DType::U8, DType::S8, DType::S32, DType::F32];
const DST_KINDS_NAMES: &str = "u8, s8, s32, f32";
const BIAS_KINDS: [DType; 3] = [DType::S8, DType::S32, DType::F32];
const BIAS_KINDS_NAMES: &str = "s8, s32, f32";

fn dims4(desc: &MemoryDesc) -> [usize; 4] {
    [desc.dims[0], desc.dims[1], desc.dims[2], desc.dims[3]]
}

/// Rank, layout and non-zero extent of a buffer.
fn check_structure(desc: &MemoryDesc, role: &'static str, layout: Layout) -> Result<(), ConfigError> {
    if desc.dims.len() != layout.rank() {
        return Err(ConfigError::InvalidRank {
            role,
            expected: layout.rank(),
            actual: desc.dims.len(),
        });
    }
    if desc.layout != layout {
        return Err(ConfigError::InvalidLayout {
            role,
            expected: layout,
            actual: desc.layout,
        });
    }
    if desc.dims.contains(&0) {
        return Err(ConfigError::ZeroDim {
            role,
            dims: desc.dims.clone(),
        });
    }
    Ok(())
}

fn check_dtype(
    desc: &MemoryDesc,
    role: &'static str,
    allowed: &[DType],
    names: &'static str,
) -> Result<DType, ConfigError> {
    if allowed.contains(&desc.dtype) {
        Ok(desc.dtype)
    } else {
        Err(ConfigError::InvalidDType {
            role,
            dtype: desc.dtype,
            allowed: names,
        })
    }
}

fn check_desc(
    desc: &MemoryDesc,
    role: &'static str,
    layout: Layout,
    allowed: &[DType],
    names: &'static str,
) -> Result<(), ConfigError> {
    check_structure(desc, role, layout)?;
    check_dtype(desc, role, allowed, names).map(|_| ())
}

fn check_blocked(role: &'static str, channels: usize) -> Result<(), ConfigError> {
    if channels % WEIGHT_BLOCK != 0 {
        return Err(ConfigError::UnblockedChannels {
            role,
            channels,
            block: WEIGHT_BLOCK,
        });
    }
    Ok(())
}

fn check_dim(
    role: &'static str,
    dim: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), ConfigError> {
    if expected != actual {
        return Err(ConfigError::DimMismatch {
            role,
            dim,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Returns the bias kind, `Undef` when absent.
fn check_bias(
    bias: Option<&MemoryDesc>,
    role: &'static str,
    channels: usize,
) -> Result<DType, ConfigError> {
    let Some(desc) = bias else {
        return Ok(DType::Undef);
    };
    check_desc(desc, role, Layout::X, &BIAS_KINDS, BIAS_KINDS_NAMES)?;
    check_dim(role, "length", channels, desc.dims[0])?;
    Ok(desc.dtype)
}

fn check_scales(stage: usize, scales: &[f32], channels: usize) -> Result<(), ConfigError> {
    if scales.len() != 1 && scales.len() != channels {
        return Err(ConfigError::ScaleLength {
            stage,
            actual: scales.len(),
            channels,
        });
    }
    if let Some((index, &value)) = scales
        .iter()
        .enumerate()
        .find(|(_, s)| !s.is_finite() || **s < 0.0)
    {
        return Err(ConfigError::InvalidScale {
            stage,
            index,
            value,
        });
    }
    Ok(())
}

