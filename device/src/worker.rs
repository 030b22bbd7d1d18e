// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-core worker thread loop. One of these runs on each worker thread
//! for the lifetime of the [`crate::device::Device`] that owns it.

use std::sync::Arc;

use crate::cpu;
use crate::device::Shared;
use crate::workgroup::WorkGroupControlBlock;

/// Run forever on the calling thread until [`Shared`] publishes the
/// shutdown sentinel:
///
/// ```text
/// loop:
///     acquire device mutex
///     wait on device.ready until current_exec changes or shutdown
///     if shutdown: release mutex, return
///     exec = device.current_exec
///     release device mutex
///     per_group_setup(exec)
///     loop:
///         g = exec.claim_next_group()
///         if g is none: break
///         launch(g, exec)
///     per_group_teardown(exec)
///     acquire device mutex
///     device.num_done += 1
///     if device.num_done == device.num_cores:
///         signal device.done
///     release device mutex
/// ```
///
/// The last worker to finish a submission is the one that wakes
/// `Device::submit`, so the equality check above has to be exact — signaling
/// on every completion would wake callers on work-groups still in flight.
pub fn run(core: usize, shared: Arc<Shared>, max_items_per_group: usize) {
    cpu::pin_current_thread_to_core(core);

    let mut wgcb = match WorkGroupControlBlock::new(max_items_per_group) {
        Ok(wgcb) => wgcb,
        Err(err) => crate::fatal!("worker {core}: failed to allocate work-group stacks: {err}"),
    };

    let mut last_seen_generation = 0u64;
    loop {
        let exec = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                if state.generation != last_seen_generation {
                    if let Some(exec) = state.current_exec.clone() {
                        last_seen_generation = state.generation;
                        break exec;
                    }
                }
                state = shared.ready.wait(state).unwrap();
            }
        };

        wgcb.per_group_setup(&exec);
        while let Some(group) = exec.dispatcher.claim_next_group() {
            wgcb.launch(group, &exec);
        }
        wgcb.per_group_teardown();

        let mut state = shared.state.lock().unwrap();
        state.num_done += 1;
        if state.num_done == state.num_cores {
            shared.done.notify_all();
        }
    }
}
