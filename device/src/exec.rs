// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One kernel submission in flight: the immutable record every worker reads
//! from, and the lock-free counter that hands out work-group indices.

use std::sync::atomic::{AtomicUsize, Ordering};

use fiber::VectorRegs;

use crate::kernel::Kernel;
use crate::ndrange::NDRange;

/// Hands out work-group indices to whichever worker asks next. Lock-free:
/// a single atomic fetch-add is all a claim needs, so no worker ever blocks
/// another just to pick up its next group.
pub struct Dispatcher {
    next_group: AtomicUsize,
    num_groups: usize,
}

impl Dispatcher {
    pub fn new(num_groups: usize) -> Self {
        Self { next_group: AtomicUsize::new(0), num_groups }
    }

    /// Claim the next unclaimed work-group index, or `None` once every
    /// group has been claimed. Every successful call returns a distinct
    /// index exactly once, regardless of how many workers call
    /// concurrently.
    pub fn claim_next_group(&self) -> Option<usize> {
        let idx = self.next_group.fetch_add(1, Ordering::Relaxed);
        if idx < self.num_groups { Some(idx) } else { None }
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }
}

/// Everything a worker needs to run any work-group of one kernel
/// submission. Shared read-only across every worker thread for the
/// lifetime of the submission; built once by [`crate::device::Device::submit`].
pub struct ExecutionRecord {
    pub kernel: Kernel,
    pub ndrange: NDRange,
    /// The argument frame as supplied at submission time, before any
    /// group-local-memory parameters are patched to point at a
    /// freshly-allocated block (see
    /// [`crate::workgroup::WorkGroupControlBlock::per_group_setup`]).
    pub frame_template: Vec<usize>,
    /// Vector-register state to reload on every work-item resume, if the
    /// kernel needs it (see [`fiber::VectorRegs`]). `None` on backends or
    /// kernels that don't use it.
    pub regs: Option<VectorRegs>,
    /// Work-group coordinate offset added to every group id before it is
    /// scaled into a global coordinate. Always `[0, 0, 0]` for a kernel
    /// submitted to a single device through [`crate::device::Device`];
    /// retained as a field (rather than folded away) because keeping
    /// `group_id` and `group_start` separate from `global_offset` in the id
    /// formula is what would let a future caller partition one NDRange's
    /// groups across multiple devices, each dispatching a contiguous
    /// sub-range starting at a nonzero `group_start` — this engine doesn't
    /// implement that partitioning itself.
    pub group_start: [usize; 3],
    pub dispatcher: Dispatcher,
}

impl ExecutionRecord {
    pub fn new(kernel: Kernel, ndrange: NDRange, frame_template: Vec<usize>, regs: Option<VectorRegs>) -> Self {
        let dispatcher = Dispatcher::new(ndrange.num_groups());
        Self { kernel, ndrange, frame_template, regs, group_start: [0, 0, 0], dispatcher }
    }
}
