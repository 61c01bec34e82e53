//! Process-wide kernel cache.
//!
//! Kernels are created by [`select_kernel`] on first use of a [`KernelKey`]
//! and shared afterwards, so operators built repeatedly for the same
//! configuration reuse one instance.
//!
//! The cache only holds weak references: a kernel is freed with the last
//! operator using it, and dead entries are pruned on the next miss.
//!
//! # Thread Safety
//!
//! The cache is guarded by a `Mutex` that is only held during lookup and
//! insertion. Kernels themselves are immutable and shared via `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use crate::conv::StageConf;

use super::{ComputeKernel, DirectConvKernel, Isa, KernelKey};

type KernelMap = HashMap<KernelKey, Weak<dyn ComputeKernel>>;

static KERNEL_CACHE: OnceLock<Mutex<KernelMap>> = OnceLock::new();

/// Get or create the kernel for one stage of an accepted configuration.
///
/// The inner loop is specialized for the best instruction set the CPU offers.
pub fn select_kernel(stage: &StageConf, fused: bool) -> Arc<dyn ComputeKernel> {
    get_or_create_kernel(KernelKey::new(stage, fused, Isa::detect()))
}

/// Get or create the kernel for an explicit key.
pub fn get_or_create_kernel(key: KernelKey) -> Arc<dyn ComputeKernel> {
    let cache = KERNEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(kernel) = guard.get(&key).and_then(Weak::upgrade) {
        log::debug!("Kernel cache hit for {}", describe(&key));
        return kernel;
    }

    guard.retain(|_, kernel| kernel.strong_count() > 0);
    log::debug!("Kernel cache miss, creating {:?} kernel for {}", key.isa, describe(&key));
    let kernel: Arc<dyn ComputeKernel> = Arc::new(DirectConvKernel::new(key));
    guard.insert(key, Arc::downgrade(&kernel));
    kernel
}

/// Drops every cached kernel. Kernels held by live operators stay valid.
pub fn clear_kernel_cache() {
    if let Some(cache) = KERNEL_CACHE.get() {
        let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
        let count = guard.len();
        guard.clear();
        log::debug!("Cleared {} cached kernels", count);
    }
}

/// Number of cached kernels still held by at least one operator.
pub fn kernel_cache_len() -> usize {
    KERNEL_CACHE
        .get()
        .map(|c| {
            c.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .filter(|k| k.strong_count() > 0)
                .count()
        })
        .unwrap_or(0)
}

fn describe(key: &KernelKey) -> String {
    let s = &key.shape;
    format!(
        "{}x{} conv {}->{} ch (g{}), {}/{}/{}->{}, oc_block {}, ow_block {}{}",
        s.kh,
        s.kw,
        s.ic,
        s.oc,
        s.groups,
        key.src_dt,
        key.wei_dt,
        key.bias_dt,
        key.dst_dt,
        key.oc_block,
        key.ow_block,
        if key.fused { ", fused" } else { "" }
    )
}
