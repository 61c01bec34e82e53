//! Quantized convolution with an optional fused 1x1 stage.
//!
//! ```text
//! stage 0: mid = requant(conv_kxk(src, weights) + bias)    -> u8 when fused
//! stage 1: dst = requant(conv_1x1(mid, weights1x1) + bias1x1)
//! ```
//!
//! Each stage splits its destination into chunks of `ow_block` pixels (one
//! batch item, one output row) with all their channels. Chunks are disjoint,
//! so workers write without locking; a worker walks every channel block of
//! its chunk with its own workspace slice. Stage 1 starts only after every
//! chunk of stage 0 has been written.

use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::conv::{ConvConf, StageConf};
use crate::kernels::{BiasSlice, ComputeKernel, DstSliceMut, StageIo, Tile};
use crate::tensor::{Buffer, BufferData, Element};
use crate::workspace::WorkspaceArena;

use super::Op;

/// Buffers and resources of the fused 1x1 stage.
#[derive(Debug)]
pub(crate) struct Conv1x1Stage {
    pub weights: Buffer,
    pub bias: Option<Buffer>,
    /// Operator-owned u8 result of stage 0.
    pub intermediate: Buffer,
    pub kernel: Arc<dyn ComputeKernel>,
    pub workspace: WorkspaceArena,
}

/// A built convolution operator, bound to its buffers.
///
/// Created by [`ConvBuilder`](super::ConvBuilder). Every call to
/// [`execute`](Op::execute) recomputes the destination from the current
/// contents of the bound buffers; configuration never changes.
#[derive(Debug)]
pub struct FusedConv {
    pub(crate) conf: ConvConf,
    pub(crate) src: Buffer,
    pub(crate) weights: Buffer,
    pub(crate) bias: Option<Buffer>,
    pub(crate) dst: Buffer,
    pub(crate) kernel: Arc<dyn ComputeKernel>,
    pub(crate) workspace: WorkspaceArena,
    pub(crate) conv1x1: Option<Conv1x1Stage>,
    pub(crate) pool: ThreadPool,
}

impl FusedConv {
    pub fn conf(&self) -> &ConvConf {
        &self.conf
    }

    pub fn dst(&self) -> &Buffer {
        &self.dst
    }

    /// The stage-0 result of a fused convolution, `None` when not fused.
    pub fn intermediate(&self) -> Option<&Buffer> {
        self.conv1x1.as_ref().map(|f| &f.intermediate)
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn kernels(&self) -> Vec<&Arc<dyn ComputeKernel>> {
        std::iter::once(&self.kernel)
            .chain(self.conv1x1.as_ref().map(|f| &f.kernel))
            .collect()
    }
}

impl Op for FusedConv {
    fn name(&self) -> &'static str {
        if self.conf.is_fused() {
            "conv_1x1_fused"
        } else {
            "conv"
        }
    }

    fn execute(&mut self) {
        // stage-0 guards drop before stage 1 locks its inputs; a buffer may
        // be bound to both stages
        {
            let src = self.src.read();
            let weights = self.weights.read();
            let bias = self.bias.as_ref().map(|b| b.read());
            let io0 = StageIo {
                src: typed(&src, "src"),
                weights: typed(&weights, "weights"),
                bias: BiasSlice::from_data(bias.as_deref()),
                scales: &self.conf.conv0.scales,
            };
            let mut out = match &self.conv1x1 {
                Some(fused) => fused.intermediate.write(),
                None => self.dst.write(),
            };
            run_stage(&self.pool, &*self.kernel, &self.conf.conv0, &self.workspace, &io0, &mut out);
        }

        let Some(fused) = &self.conv1x1 else {
            return;
        };
        let Some(conv1) = &self.conf.conv1 else {
            panic!("fused operator without a 1x1 stage configuration");
        };
        let mid = fused.intermediate.read();
        let weights1 = fused.weights.read();
        let bias1 = fused.bias.as_ref().map(|b| b.read());
        let io1 = StageIo {
            src: typed(&mid, "intermediate"),
            weights: typed(&weights1, "weights1x1"),
            bias: BiasSlice::from_data(bias1.as_deref()),
            scales: &conv1.scales,
        };
        let mut dst = self.dst.write();
        run_stage(&self.pool, &*fused.kernel, conv1, &fused.workspace, &io1, &mut dst);
    }
}

/// Typed view of a bound buffer whose kind was checked at construction.
fn typed<'a, T: Element>(data: &'a BufferData, role: &str) -> &'a [T] {
    data.as_slice::<T>().unwrap_or_else(|| {
        panic!(
            "{} storage holds {}, configured for {}",
            role,
            data.dtype(),
            T::DTYPE
        )
    })
}

/// Runs every tile of one stage on `pool` and returns when all are written.
fn run_stage(
    pool: &ThreadPool,
    kernel: &dyn ComputeKernel,
    stage: &StageConf,
    workspace: &WorkspaceArena,
    io: &StageIo<'_>,
    dst: &mut BufferData,
) {
    match dst {
        BufferData::U8(v) => run_chunks(pool, kernel, stage, workspace, io, v.as_mut_slice()),
        BufferData::S8(v) => run_chunks(pool, kernel, stage, workspace, io, v.as_mut_slice()),
        BufferData::S32(v) => run_chunks(pool, kernel, stage, workspace, io, v.as_mut_slice()),
        BufferData::F32(v) => run_chunks(pool, kernel, stage, workspace, io, v.as_mut_slice()),
    }
}

fn run_chunks<T>(
    pool: &ThreadPool,
    kernel: &dyn ComputeKernel,
    stage: &StageConf,
    workspace: &WorkspaceArena,
    io: &StageIo<'_>,
    dst: &mut [T],
) where
    T: Send,
    for<'a> DstSliceMut<'a>: From<&'a mut [T]>,
{
    pool.install(|| {
        dst.par_chunks_mut(stage.chunk_len())
            .enumerate()
            .for_each(|(chunk, out)| {
                let tile = Tile::from_chunk(chunk, &stage.shape, stage.ow_block);
                let mut ws = workspace.claim_current();
                let mut out = DstSliceMut::from(out);
                for ob in 0..stage.num_oc_blocks() {
                    let tile = tile.with_oc0(ob * stage.oc_block);
                    kernel.compute_tile(&tile, io, &mut ws[..], &mut out);
                }
            });
    });
}
