//! Convolution shape descriptors and per-stage requantization parameters.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::conv_output_size;

/// Rounding applied when requantizing to an integral destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundMode {
    /// Round half away from zero.
    #[default]
    Nearest,
    /// Round toward negative infinity.
    Down,
}

impl RoundMode {
    #[inline(always)]
    pub fn apply(self, v: f32) -> f32 {
        match self {
            RoundMode::Nearest => v.round(),
            RoundMode::Down => v.floor(),
        }
    }
}

/// Requantization settings of one convolution stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageParams {
    /// One uniform scale, or one scale per output channel.
    pub scales: Vec<f32>,
    #[serde(default)]
    pub round_mode: RoundMode,
    /// Clamp negative values to zero before scaling.
    #[serde(default)]
    pub relu: bool,
}

impl Default for StageParams {
    fn default() -> Self {
        Self {
            scales: vec![1.0],
            round_mode: RoundMode::Nearest,
            relu: false,
        }
    }
}

impl StageParams {
    pub fn new(scales: Vec<f32>) -> Self {
        Self {
            scales,
            ..Self::default()
        }
    }

    pub fn with_round_mode(mut self, round_mode: RoundMode) -> Self {
        self.round_mode = round_mode;
        self
    }

    pub fn with_relu(mut self, relu: bool) -> Self {
        self.relu = relu;
        self
    }
}

/// Geometry of a single convolution stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageShape {
    pub bs: usize,
    pub groups: usize,
    pub ic: usize,
    pub ih: usize,
    pub iw: usize,
    pub oc: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub ph: usize,
    pub pw: usize,
    pub sh: usize,
    pub sw: usize,
}

impl StageShape {
    pub fn ic_per_group(&self) -> usize {
        self.ic / self.groups
    }

    pub fn oc_per_group(&self) -> usize {
        self.oc / self.groups
    }

    pub fn src_dims(&self) -> [usize; 4] {
        [self.bs, self.ic, self.ih, self.iw]
    }

    pub fn weights_dims(&self) -> [usize; 4] {
        [self.oc, self.ic_per_group(), self.kh, self.kw]
    }

    pub fn dst_dims(&self) -> [usize; 4] {
        [self.bs, self.oc, self.oh, self.ow]
    }
}

/// Full shape descriptor of a (possibly fused) convolution.
///
/// Field names follow the usual abbreviations: `bs` batch, `gp` groups,
/// `ic/ih/iw` input channels and size, `oc/oh/ow` output, `kh/kw` kernel,
/// `ph/pw` padding, `sh/sw` stride, `dh/dw` dilation, and `oc1x1` the output
/// channels of the fused 1x1 stage (0 when not fused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvParams {
    pub bs: usize,
    #[serde(default = "default_groups")]
    pub gp: usize,
    pub ic: usize,
    pub ih: usize,
    pub iw: usize,
    pub oc: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub ph: usize,
    pub pw: usize,
    pub sh: usize,
    pub sw: usize,
    #[serde(default)]
    pub oc1x1: usize,
    #[serde(default)]
    pub dh: usize,
    #[serde(default)]
    pub dw: usize,
}

fn default_groups() -> usize {
    1
}

impl ConvParams {
    /// Loads a list of shape cases from a JSON array.
    pub fn from_json(json: &str) -> Result<Vec<ConvParams>> {
        serde_json::from_str(json).context("Failed to parse convolution cases")
    }

    /// Loads a list of shape cases from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Vec<ConvParams>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read convolution cases from {:?}", path))?;
        Self::from_json(&text)
    }

    pub fn is_fused(&self) -> bool {
        self.oc1x1 > 0
    }

    /// Output size implied by input, kernel, stride, padding and dilation.
    pub fn expected_output_size(&self) -> Option<(usize, usize)> {
        Some((
            conv_output_size(self.ih, self.kh, self.sh, self.ph, self.dh)?,
            conv_output_size(self.iw, self.kw, self.sw, self.pw, self.dw)?,
        ))
    }

    /// Descriptor of the fused 1x1 stage: it consumes this stage's output.
    pub fn conv1x1(&self) -> ConvParams {
        ConvParams {
            gp: 1,
            ic: self.oc,
            ih: self.oh,
            iw: self.ow,
            oc: self.oc1x1,
            kh: 1,
            kw: 1,
            ph: 0,
            pw: 0,
            sh: 1,
            sw: 1,
            oc1x1: 0,
            dh: 0,
            dw: 0,
            ..*self
        }
    }

    pub fn stage0(&self) -> StageShape {
        StageShape {
            bs: self.bs,
            groups: self.gp,
            ic: self.ic,
            ih: self.ih,
            iw: self.iw,
            oc: self.oc,
            oh: self.oh,
            ow: self.ow,
            kh: self.kh,
            kw: self.kw,
            ph: self.ph,
            pw: self.pw,
            sh: self.sh,
            sw: self.sw,
        }
    }

    pub fn stage1(&self) -> Option<StageShape> {
        self.is_fused().then(|| self.conv1x1().stage0())
    }

    pub fn src_dims(&self) -> [usize; 4] {
        self.stage0().src_dims()
    }

    pub fn weights_dims(&self) -> [usize; 4] {
        self.stage0().weights_dims()
    }

    pub fn weights1x1_dims(&self) -> [usize; 4] {
        [self.oc1x1, self.oc, 1, 1]
    }

    /// Dimensions of the caller-visible destination: the 1x1 stage's output
    /// when fused, otherwise the first stage's.
    pub fn dst_dims(&self) -> [usize; 4] {
        if self.is_fused() {
            [self.bs, self.oc1x1, self.oh, self.ow]
        } else {
            [self.bs, self.oc, self.oh, self.ow]
        }
    }
}
