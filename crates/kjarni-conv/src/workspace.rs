//! Per-worker accumulation scratch space.
//!
//! The arena is allocated once when an operator is built and reused by every
//! execution, so the hot path never allocates. Each worker of the operator's
//! pool owns the slice at its pool index for the duration of one tile.
//!
//! # Memory Layout
//!
//! | Slice | Length | Usage |
//! |-------|--------|-------|
//! | `i` | `slice_len` | accumulators of the tile worker `i` is computing |

use std::sync::{Mutex, MutexGuard, TryLockError};

/// A fixed set of equally sized `i32` scratch slices.
#[derive(Debug)]
pub struct WorkspaceArena {
    slices: Vec<Mutex<Vec<i32>>>,
    slice_len: usize,
}

impl WorkspaceArena {
    pub fn new(num_slices: usize, slice_len: usize) -> Self {
        log::debug!(
            "Workspace arena: {} slices x {} accumulators ({} KiB)",
            num_slices,
            slice_len,
            num_slices * slice_len * std::mem::size_of::<i32>() / 1024
        );
        Self {
            slices: (0..num_slices).map(|_| Mutex::new(vec![0; slice_len])).collect(),
            slice_len,
        }
    }

    pub fn num_slices(&self) -> usize {
        self.slices.len()
    }

    pub fn slice_len(&self) -> usize {
        self.slice_len
    }

    /// Claims the slice of `worker` until the guard is dropped.
    ///
    /// # Panics
    ///
    /// If `worker` has no slice, or its slice is already claimed. Both mean
    /// the arena was sized for a different pool than the one running tiles,
    /// and continuing would share scratch memory between tiles.
    pub fn claim(&self, worker: usize) -> MutexGuard<'_, Vec<i32>> {
        let Some(slot) = self.slices.get(worker) else {
            panic!(
                "worker {} has no workspace slice (arena holds {})",
                worker,
                self.slices.len()
            );
        };
        match slot.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                panic!("workspace slice {} is already claimed by another tile", worker)
            }
        }
    }

    /// Claims the slice of the current rayon worker.
    ///
    /// # Panics
    ///
    /// If called outside a rayon pool, or under the conditions of [`claim`](Self::claim).
    pub fn claim_current(&self) -> MutexGuard<'_, Vec<i32>> {
        match rayon::current_thread_index() {
            Some(worker) => self.claim(worker),
            None => panic!("workspace claimed outside of the operator's worker pool"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_slices_are_sized_and_reused() {
        let arena = WorkspaceArena::new(2, 8);
        assert_eq!(arena.num_slices(), 2);
        assert_eq!(arena.slice_len(), 8);
        {
            let mut ws = arena.claim(1);
            assert_eq!(ws.len(), 8);
            ws[0] = 42;
        }
        // released on drop, same memory on the next claim
        assert_eq!(arena.claim(1)[0], 42);
    }

    #[test]
    #[should_panic(expected = "already claimed")]
    fn test_double_claim_is_fatal() {
        let arena = WorkspaceArena::new(1, 4);
        let _first = arena.claim(0);
        let _second = arena.claim(0);
    }

    #[test]
    #[should_panic(expected = "has no workspace slice")]
    fn test_out_of_range_worker_is_fatal() {
        let arena = WorkspaceArena::new(2, 4);
        let _guard = arena.claim(2);
    }

    #[test]
    #[should_panic(expected = "outside of the operator's worker pool")]
    fn test_claim_outside_pool_is_fatal() {
        let arena = WorkspaceArena::new(2, 4);
        let _guard = arena.claim_current();
    }

    #[test]
    fn test_pool_workers_get_distinct_slices() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        let arena = WorkspaceArena::new(3, 1);
        pool.install(|| {
            (0..300).into_par_iter().for_each(|_| {
                let mut ws = arena.claim_current();
                ws[0] += 1;
            });
        });
        let total: i32 = (0..3).map(|i| arena.claim(i)[0]).sum();
        assert_eq!(total, 300);
    }
}
