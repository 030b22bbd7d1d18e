// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker work-group state: the stack slab, per-item metadata, the
//! barrier cursor, and the dispatch loop that drives a group's fibers to
//! completion.

use std::alloc::{self, Layout};
use std::mem;

use fiber::stack::StackSlab;
use fiber::Fiber;

use crate::barrier::BARRIER_CELL;
use crate::exec::ExecutionRecord;
use crate::kernel::ParamKind;
use crate::ndrange::nd_address;
use crate::window::STACK_WINDOW_SIZE;
use crate::workitem::WorkItemData;

/// One per worker thread, built once and reused across every work-group
/// that worker runs. Its stacks are allocated once; only the per-item
/// metadata and argument frame are rebuilt for every new group.
pub struct WorkGroupControlBlock {
    slab: StackSlab,
    max_items: usize,
    fibers: Vec<Fiber>,
    metadata: Vec<*mut WorkItemData>,
    /// The worker's own context, saved here while a work-item fiber runs.
    main_fiber: Fiber,
    num_items: usize,
    num_done: usize,
    current_item: usize,
    local_reserved: *mut u8,
    local_reserved_layout: Option<Layout>,
    /// This group's private copy of the argument frame, as an array of
    /// machine words.
    frame: Vec<usize>,
    /// `(word_offset, layout)` for every local-memory parameter allocation
    /// made for the group currently in flight, freed at teardown.
    local_allocs: Vec<(usize, Layout)>,
}

// Safety: built and used exclusively by the worker thread that owns it;
// never shared or sent once in use. The `Send` bound only matters for the
// brief hop of constructing it before moving it into the worker's thread
// closure.
unsafe impl Send for WorkGroupControlBlock {}

const LOCAL_MEM_ALIGN: usize = 16;

impl WorkGroupControlBlock {
    /// Allocate the stack slab as `max_items` windows of
    /// [`STACK_WINDOW_SIZE`] bytes and reserve a [`WorkItemData`] block at
    /// the top of each.
    pub fn new(max_items: usize) -> std::io::Result<Self> {
        let slab = StackSlab::new(STACK_WINDOW_SIZE, max_items)?;
        let meta_size = mem::size_of::<WorkItemData>();
        let mut fibers = Vec::with_capacity(max_items);
        let mut metadata = Vec::with_capacity(max_items);

        for i in 0..max_items {
            let bottom = slab.window_bottom(i);
            let top = bottom + slab.window_size();
            let meta_ptr = (top - meta_size) as *mut WorkItemData;
            // Safety: `meta_ptr..meta_ptr+meta_size` is the top of window
            // `i`, exclusively owned by this slab and properly aligned
            // (the window is aligned to `STACK_WINDOW_SIZE`, a multiple of
            // `align_of::<WorkItemData>()`, and `meta_size` is itself a
            // multiple of that alignment).
            unsafe { meta_ptr.write(WorkItemData::zeroed()) };
            metadata.push(meta_ptr);
            fibers.push(Fiber::new(bottom, slab.window_size() - meta_size));
        }

        Ok(Self {
            slab,
            max_items,
            fibers,
            metadata,
            main_fiber: Fiber::new(0, 0),
            num_items: 0,
            num_done: 0,
            current_item: 0,
            local_reserved: std::ptr::null_mut(),
            local_reserved_layout: None,
            frame: Vec::new(),
            local_allocs: Vec::new(),
        })
    }

    /// Prepare this control block for one kernel submission: size-check,
    /// allocate group-local backing memory, and fill every item's static
    /// metadata (everything except the ids, which depend on which group is
    /// running and are filled fresh by [`Self::launch`] for each one).
    ///
    /// Called exactly once per submission per worker, before that worker's
    /// group-claiming loop starts — not once per work-group. The allocations
    /// made here (group-local reserved memory, local-memory parameters) are
    /// shared across every group this worker runs for the submission, the
    /// same way one worker's stack slab is shared across them.
    pub fn per_group_setup(&mut self, exec: &ExecutionRecord) {
        let num_items = exec.ndrange.items_per_group();
        if num_items > self.max_items {
            crate::fatal!(
                "work-group requires {num_items} items, exceeding the configured maximum of {}",
                self.max_items
            );
        }
        self.num_items = num_items;

        let kernel = &exec.kernel;
        if kernel.local_reserved_bytes > 0 {
            let layout = Layout::from_size_align(kernel.local_reserved_bytes, LOCAL_MEM_ALIGN)
                .expect("invalid local_reserved_bytes/alignment");
            // Safety: non-zero size, checked above.
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                crate::fatal!("out of memory allocating group-local reserved memory");
            }
            self.local_reserved = ptr;
            self.local_reserved_layout = Some(layout);
        } else {
            self.local_reserved = std::ptr::null_mut();
            self.local_reserved_layout = None;
        }

        let global_size = exec.ndrange.global_size;
        let local_size = exec.ndrange.local_size;

        for i in 0..num_items {
            // Safety: `self.metadata[i]` points at live, exclusively owned
            // memory for the lifetime of this control block.
            let item = unsafe { &mut *self.metadata[i] };
            *item = WorkItemData::zeroed();
            item.work_dim = exec.ndrange.work_dim;
            for dim in 0..exec.ndrange.work_dim as usize {
                item.global_size[dim] = global_size[dim];
                item.local_size[dim] = local_size[dim];
            }
            item.global_offset = [
                exec.ndrange.global_offset[0],
                exec.ndrange.global_offset[1],
                exec.ndrange.global_offset[2],
                0,
            ];
            item.barrier_func = &BARRIER_CELL;
            item.local_reserved = self.local_reserved;
            item.group_control_block = core::ptr::from_mut::<Self>(self);
        }

        self.frame = exec.frame_template.clone();
        for param in &kernel.params {
            if param.kind == ParamKind::LocalMemory {
                let requested = self.frame[param.word_offset];
                let layout = Layout::from_size_align(requested, LOCAL_MEM_ALIGN)
                    .expect("invalid local-memory parameter size/alignment");
                // Safety: non-zero size checked by kernel author contract;
                // zero-sized local-memory params are rejected by callers.
                let ptr = unsafe { alloc::alloc(layout) };
                if ptr.is_null() {
                    crate::fatal!("out of memory allocating local-memory parameter");
                }
                self.frame[param.word_offset] = ptr as usize;
                self.local_allocs.push((param.word_offset, layout));
            }
        }
    }

    /// Free every local-memory parameter allocation made by
    /// [`Self::per_group_setup`], plus the group-local reserved block.
    /// Called exactly once per submission per worker, after that worker's
    /// group-claiming loop has run out of groups to claim.
    pub fn per_group_teardown(&mut self) {
        for (word_offset, layout) in self.local_allocs.drain(..) {
            let ptr = self.frame[word_offset] as *mut u8;
            // Safety: `ptr`/`layout` are exactly what `per_group_setup`
            // allocated for this slot.
            unsafe { alloc::dealloc(ptr, layout) };
        }
        if let Some(layout) = self.local_reserved_layout.take() {
            // Safety: `self.local_reserved`/`layout` are exactly what
            // `per_group_setup` allocated.
            unsafe { alloc::dealloc(self.local_reserved, layout) };
            self.local_reserved = std::ptr::null_mut();
        }
    }

    /// Run one work-group to completion: fill per-item ids, rebuild every
    /// fiber fresh, then dispatch round-robin until every item has exited.
    pub fn launch(&mut self, group_index: usize, exec: &ExecutionRecord) {
        self.num_done = 0;
        self.current_item = 0;

        let group_counts = exec.ndrange.group_counts();
        let local_size = exec.ndrange.local_size;
        let group_id = nd_address(exec.ndrange.work_dim, group_index, &group_counts);

        let mut group_global = [0usize; 3];
        for dim in 0..3 {
            group_global[dim] = (group_id[dim] + exec.group_start[dim]) * local_size[dim]
                + exec.ndrange.global_offset[dim];
        }

        for i in 0..self.num_items {
            let local_id = nd_address(exec.ndrange.work_dim, i, &local_size);
            // Safety: see `per_group_setup`.
            let item = unsafe { &mut *self.metadata[i] };
            for dim in 0..3 {
                item.group_id[dim] = group_id[dim];
                item.group_global[dim] = group_global[dim];
                item.local_id[dim] = local_id[dim];
                item.global_id[dim] = group_global[dim] + local_id[dim];
            }
        }

        let frame_bytes = {
            // Safety: `self.frame` is a plain `Vec<usize>`; reinterpreting
            // it as bytes for the duration of this call is sound since we
            // don't mutate it while the slice is alive.
            unsafe {
                core::slice::from_raw_parts(
                    self.frame.as_ptr().cast::<u8>(),
                    core::mem::size_of_val(self.frame.as_slice()),
                )
            }
        };

        for i in 0..self.num_items {
            // Safety: each fiber's stack window is exclusively owned by
            // this control block and not currently running.
            unsafe {
                fiber::make_fiber_with_frame(
                    &mut self.fibers[i],
                    exec.kernel.entry,
                    exit_trampoline,
                    frame_bytes,
                )
            };
        }

        while self.num_done < self.num_items {
            self.current_item = 0;
            while self.current_item < self.num_items {
                let i = self.current_item;
                // Safety: `main_fiber`/`fibers[i]` are both live and this
                // thread is the only one ever touching this control block.
                unsafe {
                    fiber::switch_fiber(&mut self.main_fiber, &self.fibers[i], exec.regs.as_ref())
                };
                self.current_item += 1;
            }
        }
    }

    /// Round-robin barrier yield: advance `current_item` and switch from
    /// the sleeping item to the next one in line.
    ///
    /// # Safety
    /// Must only be called from a fiber currently being driven by
    /// [`Self::launch`]'s dispatch loop on this same control block.
    pub unsafe fn barrier(&mut self) {
        let sleep = self.current_item;
        self.current_item = (self.current_item + 1) % self.num_items;
        let wake = self.current_item;
        if sleep == wake {
            // Only one item in the group: "resume the next item" is this
            // same item, so there is nothing to switch.
            return;
        }
        // Safety: both `sleep` and `wake` are valid, distinct indices into
        // `fibers` (bounded by `num_items <= max_items`), and forwarded to
        // the caller's contract above.
        unsafe {
            let (a, b) = borrow_two(&mut self.fibers, sleep, wake);
            fiber::switch_fiber(a, b, None);
        }
    }

    /// Called from the kernel-exit trampoline when a work-item's fiber
    /// finishes. Increments `num_done` and switches back to the worker's
    /// main fiber; never returns.
    ///
    /// # Safety
    /// Must only be called from a work-item fiber currently being driven by
    /// this control block's dispatch loop.
    unsafe fn exit_current_item(&mut self) -> ! {
        self.num_done += 1;
        // Safety: `main_fiber` holds the context saved by the `switch_fiber`
        // call in `launch` that resumed the item now exiting.
        unsafe { fiber::exit_to(&self.main_fiber) }
    }
}

impl Drop for WorkGroupControlBlock {
    fn drop(&mut self) {
        self.per_group_teardown();
    }
}

/// Borrow two distinct elements of a slice mutably at once.
///
/// # Safety
/// `a != b`, both in bounds — the caller ([`WorkGroupControlBlock::barrier`])
/// guarantees this by special-casing `a == b` before calling in.
unsafe fn borrow_two<T>(slice: &mut [T], a: usize, b: usize) -> (&mut T, &T) {
    if a < b {
        let (left, right) = slice.split_at_mut(b);
        (&mut left[a], &right[0])
    } else {
        let (left, right) = slice.split_at_mut(a);
        (&mut right[0], &left[b])
    }
}

/// The fake return address every work-item fiber is built with. Locates the
/// group control block via the stack-mask trick and exits through it.
unsafe extern "C" fn exit_trampoline() -> ! {
    // Safety: only ever reached by falling off the end of a kernel entry
    // function running on a stack window carved from a
    // `WorkGroupControlBlock`'s slab.
    let wgcb: *mut WorkGroupControlBlock =
        unsafe { fiber::locate(STACK_WINDOW_SIZE, crate::workitem::GROUP_CONTROL_BLOCK_OFFSET) };
    assert!(!wgcb.is_null(), "kernel fiber exited outside of a work-group");
    // Safety: `wgcb` was stashed by `per_group_setup` and stays live for the
    // duration of the dispatch loop, the only context this can run in.
    unsafe { (*wgcb).exit_current_item() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_carves_windows_with_metadata_reserved() {
        let wgcb = WorkGroupControlBlock::new(4).unwrap();
        assert_eq!(wgcb.fibers.len(), 4);
        assert_eq!(wgcb.metadata.len(), 4);
        for fiber in &wgcb.fibers {
            assert_eq!(fiber.stack_size, STACK_WINDOW_SIZE - mem::size_of::<WorkItemData>());
        }
    }
}
