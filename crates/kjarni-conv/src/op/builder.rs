use crate::conv::{Conv1x1Descs, ConvConf, ConvDescs, ConvWindow, StageParams};
use crate::error::ConfigError;
use crate::kernels::select_kernel;
use crate::tensor::Buffer;
use crate::workspace::WorkspaceArena;

use super::fused_conv::{Conv1x1Stage, FusedConv};

/// Builder for [`FusedConv`] operators.
///
/// The builder keeps handles to the bound buffers; the caller keeps its own
/// handles to fill inputs and read the result between executions.
///
/// # Example
///
/// ```ignore
/// let mut op = ConvBuilder::new(&src, &weights, &dst)
///     .with_bias(&bias)
///     .with_padding([1, 1])
///     .with_conv0(StageParams::new(vec![0.3]).with_relu(true))
///     .with_conv1x1(&weights1x1, None, StageParams::new(vec![0.1]))
///     .build()?;
///
/// op.execute();
/// ```
#[derive(Debug, Clone)]
pub struct ConvBuilder {
    src: Buffer,
    weights: Buffer,
    bias: Option<Buffer>,
    dst: Buffer,
    window: ConvWindow,
    conv0: StageParams,
    conv1x1: Option<(Buffer, Option<Buffer>, StageParams)>,
    num_threads: Option<usize>,
}

impl ConvBuilder {
    /// Starts a builder for `dst = conv(src, weights)`.
    ///
    /// When a 1x1 stage is fused, `dst` receives the output of that stage.
    pub fn new(src: &Buffer, weights: &Buffer, dst: &Buffer) -> Self {
        Self {
            src: src.clone(),
            weights: weights.clone(),
            bias: None,
            dst: dst.clone(),
            window: ConvWindow::default(),
            conv0: StageParams::default(),
            conv1x1: None,
            num_threads: None,
        }
    }

    pub fn with_bias(mut self, bias: &Buffer) -> Self {
        self.bias = Some(bias.clone());
        self
    }

    /// Stride `[height, width]` of the first stage. Default `[1, 1]`.
    pub fn with_stride(mut self, strides: [usize; 2]) -> Self {
        self.window.strides = strides;
        self
    }

    /// Zero padding `[height, width]` of the first stage. Default `[0, 0]`.
    pub fn with_padding(mut self, padding: [usize; 2]) -> Self {
        self.window.padding = padding;
        self
    }

    /// Zero-based dilation. Only `[0, 0]` is accepted by [`build`](Self::build).
    pub fn with_dilation(mut self, dilation: [usize; 2]) -> Self {
        self.window.dilation = dilation;
        self
    }

    /// Scales, rounding and activation of the first stage.
    pub fn with_conv0(mut self, params: StageParams) -> Self {
        self.conv0 = params;
        self
    }

    /// Fuses a 1x1 convolution that consumes the first stage's output.
    pub fn with_conv1x1(
        mut self,
        weights: &Buffer,
        bias: Option<&Buffer>,
        params: StageParams,
    ) -> Self {
        self.conv1x1 = Some((weights.clone(), bias.cloned(), params));
        self
    }

    /// Size of the operator's worker pool. Defaults to the number of
    /// physical cores; 0 also selects the default.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Validates the configuration and builds the operator.
    ///
    /// Nothing is allocated when the configuration is rejected.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first constraint that failed.
    pub fn build(self) -> Result<FusedConv, ConfigError> {
        if let Err(e) = self.check_aliasing() {
            log::warn!("Rejected convolution configuration: {}", e);
            return Err(e);
        }

        let descs = ConvDescs {
            src: self.src.desc(),
            weights: self.weights.desc(),
            bias: self.bias.as_ref().map(Buffer::desc),
            dst: self.dst.desc(),
            conv1x1: self.conv1x1.as_ref().map(|(w, b, params)| Conv1x1Descs {
                weights: w.desc(),
                bias: b.as_ref().map(Buffer::desc),
                params,
            }),
        };
        let conf = ConvConf::init(&descs, &self.window, &self.conv0)?;

        let num_threads = match self.num_threads {
            Some(n) if n > 0 => n,
            _ => num_cpus::get_physical(),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("kjarni-conv-{}", i))
            .build()?;
        let workers = pool.current_num_threads();

        let kernel = select_kernel(&conf.conv0, conf.is_fused());
        let workspace = WorkspaceArena::new(workers, conf.conv0.ws_per_thread());

        let conv1x1 = match (self.conv1x1, &conf.conv1) {
            (Some((weights, bias, _)), Some(conv1)) => Some(Conv1x1Stage {
                weights,
                bias,
                intermediate: Buffer::nhwc_u8(conf.conv0.shape.dst_dims()),
                kernel: select_kernel(conv1, true),
                workspace: WorkspaceArena::new(workers, conv1.ws_per_thread()),
            }),
            _ => None,
        };

        let p = &conf.params;
        log::info!(
            "Built {} operator: src {:?}, {}x{} kernel, stride [{}, {}], padding [{}, {}], groups {}, dst {:?} {}, {} threads",
            if conv1x1.is_some() { "fused conv+1x1" } else { "conv" },
            p.src_dims(),
            p.kh,
            p.kw,
            p.sh,
            p.sw,
            p.ph,
            p.pw,
            p.gp,
            p.dst_dims(),
            conf.last_stage().dst_dt,
            workers
        );

        Ok(FusedConv {
            conf,
            src: self.src,
            weights: self.weights,
            bias: self.bias,
            dst: self.dst,
            kernel,
            workspace,
            conv1x1,
            pool,
        })
    }

    /// The destination is written while inputs are read, so it must not
    /// share storage with any of them.
    fn check_aliasing(&self) -> Result<(), ConfigError> {
        let mut inputs: Vec<(&'static str, &Buffer)> =
            vec![("src", &self.src), ("weights", &self.weights)];
        if let Some(b) = &self.bias {
            inputs.push(("bias", b));
        }
        if let Some((w, b, _)) = &self.conv1x1 {
            inputs.push(("weights1x1", w));
            if let Some(b) = b {
                inputs.push(("bias1x1", b));
            }
        }
        match inputs.iter().find(|(_, b)| b.same_storage(&self.dst)) {
            Some(&(input, _)) => Err(ConfigError::AliasedBuffers { dst: "dst", input }),
            None => Ok(()),
        }
    }
}
