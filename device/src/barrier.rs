// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The barrier primitive: a round-robin fiber yield. Kernels never call
//! this directly — they call through the indirection cell in their
//! [`crate::workitem::WorkItemData`] so the runtime can hot-swap the
//! implementation without changing the kernel ABI.

use crate::window::STACK_WINDOW_SIZE;
use crate::workgroup::WorkGroupControlBlock;
use crate::workitem::GROUP_CONTROL_BLOCK_OFFSET;

pub type BarrierFn = unsafe extern "C" fn(flags: u32);

/// The address of this static is what every work-item's `barrier_func`
/// field points at.
pub static BARRIER_CELL: BarrierFn = barrier;

/// Entered through one level of indirection from kernel code. Locates the
/// running work-item's group via the stack-mask trick and advances the
/// round-robin cursor.
///
/// # Safety
/// Must only ever be called from a fiber running on a stack window carved
/// out of a [`crate::stack::StackSlab`] with window size
/// [`STACK_WINDOW_SIZE`], with a live `WorkGroupControlBlock` pointer
/// stashed at the fixed offset in its `WorkItemData`.
pub unsafe extern "C" fn barrier(_flags: u32) {
    // Safety: forwarded to the caller's contract above.
    let wgcb: *mut WorkGroupControlBlock =
        unsafe { fiber::locate(STACK_WINDOW_SIZE, GROUP_CONTROL_BLOCK_OFFSET) };
    assert!(!wgcb.is_null(), "barrier() called outside of a work-group fiber");
    // Safety: `wgcb` was stashed by `WorkGroupControlBlock::per_group_setup`
    // and stays live for the duration of the group's dispatch loop, which
    // is the only context this function can run in.
    unsafe { (*wgcb).barrier() };
}
