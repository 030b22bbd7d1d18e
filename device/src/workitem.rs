// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-item metadata block kernels read to implement index queries,
//! and the stack-mask offset that locates it.

use crate::barrier::BarrierFn;
use crate::workgroup::WorkGroupControlBlock;

/// Placed at the top of each fiber's stack window. `#[repr(C)]` because the
/// kernel ABI reads these fields directly by offset — no field may move
/// without also updating whatever compiles kernel index queries against it.
#[repr(C)]
pub struct WorkItemData {
    pub global_id: [usize; 4],
    pub local_id: [usize; 4],
    pub group_id: [usize; 4],
    pub group_global: [usize; 4],
    pub global_offset: [usize; 4],
    pub global_size: [usize; 4],
    pub local_size: [usize; 4],
    pub work_dim: u32,
    /// Pointer to the indirection cell holding the address of the barrier
    /// function — kernels call through this one level of indirection so
    /// the runtime can hot-swap the implementation.
    pub barrier_func: *const BarrierFn,
    /// Group-local "reserved" memory the kernel declared a fixed size for.
    pub local_reserved: *mut u8,
    /// The pointer the stack-mask trick recovers. Kept last in the struct
    /// so this field's offset from the window top is simply
    /// `-size_of::<*mut WorkGroupControlBlock>()`, independent of how many
    /// other fields this block grows to hold.
    pub group_control_block: *mut WorkGroupControlBlock,
}

impl WorkItemData {
    /// A zeroed block with `global_size`/`local_size` defaulted to 1 in
    /// every dimension: per-group setup only fills `global_size[0..dims]`/
    /// `local_size[0..dims]`, so dimensions past `work_dim` must read as
    /// size 1, not 0, or the id-decomposition formula would divide by zero.
    pub fn zeroed() -> Self {
        Self {
            global_id: [0; 4],
            local_id: [0; 4],
            group_id: [0; 4],
            group_global: [0; 4],
            global_offset: [0; 4],
            global_size: [1; 4],
            local_size: [1; 4],
            work_dim: 0,
            barrier_func: std::ptr::null(),
            local_reserved: std::ptr::null_mut(),
            group_control_block: std::ptr::null_mut(),
        }
    }
}

/// Byte offset of [`WorkItemData::group_control_block`] from the *end* of
/// the struct (i.e. from the top of the stack window it's placed at),
/// always negative. Computed once at compile time rather than hand-counted,
/// so it keeps tracking the real field layout as the struct changes shape.
#[allow(clippy::cast_possible_wrap, reason = "WorkItemData is far smaller than isize::MAX; wrap is not reachable")]
pub const GROUP_CONTROL_BLOCK_OFFSET: isize = {
    let offset = core::mem::offset_of!(WorkItemData, group_control_block) as isize;
    let size = core::mem::size_of::<WorkItemData>() as isize;
    offset - size
};

/// Byte offset of the whole [`WorkItemData`] block from the top of its
/// stack window — the block is placed flush against the top, so this is
/// just its negated size.
#[allow(clippy::cast_possible_wrap, reason = "WorkItemData is far smaller than isize::MAX; wrap is not reachable")]
pub const WORK_ITEM_DATA_OFFSET: isize = -(core::mem::size_of::<WorkItemData>() as isize);

/// Recover the calling work-item's own metadata block via the stack-mask
/// trick. Kernels use this (through whatever thin wrapper the kernel ABI
/// exposes) to implement index queries like "get my global id".
///
/// # Safety
/// Must only be called from a fiber running on a stack window carved out
/// of the process-wide stack-window-sized slab with a `WorkItemData`
/// written at its top, i.e. from inside a kernel entry point or something
/// it calls.
pub unsafe fn current() -> *mut WorkItemData {
    // Safety: forwarded to the caller's contract above.
    unsafe { fiber::locate(crate::window::STACK_WINDOW_SIZE, WORK_ITEM_DATA_OFFSET) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::cast_possible_wrap, reason = "size_of::<usize>() trivially fits in isize")]
    fn control_block_offset_is_last_pointer_width() {
        assert_eq!(GROUP_CONTROL_BLOCK_OFFSET, -(core::mem::size_of::<usize>() as isize));
    }
}
