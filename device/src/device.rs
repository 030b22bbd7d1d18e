// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The device coordinator: owns the worker pool, publishes kernel
//! submissions to it, and exposes the byte-for-byte "device memory is host
//! memory" surface.

use std::alloc::{self, Layout};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use fiber::VectorRegs;

use crate::config::DeviceConfig;
use crate::cpu;
use crate::error::DeviceError;
use crate::exec::ExecutionRecord;
use crate::kernel::Kernel;
use crate::ndrange::NDRange;
use crate::worker;

pub(crate) struct DeviceState {
    pub(crate) current_exec: Option<Arc<ExecutionRecord>>,
    /// Bumped on every `submit`, so a worker that wakes spuriously (or is
    /// still draining the previous submission) can tell a fresh one apart
    /// from the one it already started on.
    pub(crate) generation: u64,
    pub(crate) num_done: usize,
    pub(crate) num_cores: usize,
    pub(crate) shutdown: bool,
}

/// State and condvars shared between [`Device`] and every worker thread.
/// Split out from `Device` itself so workers can hold an `Arc` to just
/// this, independent of the `Device` handle's own lifetime.
pub(crate) struct Shared {
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) ready: Condvar,
    pub(crate) done: Condvar,
}

/// Owns a pool of worker threads, each running one core's work-group
/// dispatch loop. Coordination is a mutex guarding a small amount of shared
/// state, plus two condition variables (`ready` for "a new kernel was
/// submitted", `done` for "every worker has drained it").
pub struct Device {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    config: DeviceConfig,
}

impl Device {
    /// Start the worker pool. Thread-creation failure at startup is fatal —
    /// there is no well-defined partial-pool state to recover into.
    pub fn new(config: DeviceConfig) -> Self {
        let num_cores = config.num_workers.unwrap_or_else(cpu::count).max(1);

        let shared = Arc::new(Shared {
            state: Mutex::new(DeviceState {
                current_exec: None,
                generation: 0,
                num_done: 0,
                num_cores,
                shutdown: false,
            }),
            ready: Condvar::new(),
            done: Condvar::new(),
        });

        let max_work_group_size = config.max_work_group_size;
        let workers = (0..num_cores)
            .map(|core| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("device-worker-{core}"))
                    .spawn(move || worker::run(core, shared, max_work_group_size))
                    .unwrap_or_else(|err| crate::fatal!("failed to spawn worker thread {core}: {err}"))
            })
            .collect();

        log::trace!("device started with {num_cores} worker(s)");
        Self { shared, workers, config }
    }

    /// Submit one kernel launch and block until every work-group in it has
    /// run to completion on some worker.
    pub fn submit(
        &self,
        kernel: Kernel,
        ndrange: NDRange,
        frame_template: Vec<usize>,
        regs: Option<VectorRegs>,
    ) -> Result<(), DeviceError> {
        let items_per_group = ndrange.items_per_group();
        if items_per_group > self.config.max_work_group_size {
            return Err(DeviceError::WorkGroupTooLarge {
                items_per_group,
                max: self.config.max_work_group_size,
            });
        }

        let exec = Arc::new(ExecutionRecord::new(kernel, ndrange, frame_template, regs));
        log::trace!("submitting kernel over {} work-group(s)", exec.dispatcher.num_groups());

        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Err(DeviceError::ShuttingDown);
        }
        state.current_exec = Some(exec);
        state.generation += 1;
        state.num_done = 0;
        self.shared.ready.notify_all();

        let _state = self
            .shared
            .done
            .wait_while(state, |s| s.num_done != s.num_cores)
            .unwrap();
        log::trace!("kernel submission complete");
        Ok(())
    }

    /// Publish the shutdown sentinel and join every worker thread.
    pub fn shutdown(mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.ready.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        log::trace!("device shut down");
    }

    /// Number of worker threads backing this device — the same value used
    /// to size the pool at construction.
    pub fn preferred_workgroup_count(&self) -> usize {
        self.workers.len()
    }

    /// Allocate `size` bytes aligned to `config.mem_base_addr_align`. Host
    /// memory *is* device memory for this engine; out-of-memory is fatal.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        let layout = Layout::from_size_align(size.max(1), self.config.mem_base_addr_align)
            .unwrap_or_else(|err| crate::fatal!("invalid allocation layout: {err}"));
        // Safety: non-zero size (via `.max(1)` above).
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            crate::fatal!("out of memory allocating {size} bytes");
        }
        ptr
    }

    /// Free a block previously returned by [`Self::alloc`] with the same
    /// `size`.
    ///
    /// # Safety
    /// `ptr` must have been returned by `self.alloc(size)` and not already
    /// freed.
    pub unsafe fn free(&self, ptr: *mut u8, size: usize) {
        let layout = Layout::from_size_align(size.max(1), self.config.mem_base_addr_align)
            .expect("size/align matches a prior alloc() call");
        // Safety: forwarded to the caller's contract above.
        unsafe { alloc::dealloc(ptr, layout) };
    }

    /// Byte-for-byte `memmove` from device memory at `src` into `dst`.
    ///
    /// # Safety
    /// `src..+len` and `dst..+len` must both be valid for the respective
    /// access, though they may overlap (see [`std::ptr::copy`]).
    pub unsafe fn read(&self, src: *const u8, dst: *mut u8, len: usize) {
        // Safety: forwarded to the caller's contract above.
        unsafe { std::ptr::copy(src, dst, len) };
    }

    /// Byte-for-byte `memmove` from host memory at `src` into device memory
    /// at `dst`.
    ///
    /// # Safety
    /// Same as [`Self::read`], with `src`/`dst` roles matching the
    /// direction of the copy.
    pub unsafe fn write(&self, src: *const u8, dst: *mut u8, len: usize) {
        // Safety: forwarded to the caller's contract above.
        unsafe { std::ptr::copy(src, dst, len) };
    }

    /// Byte-for-byte `memmove` between two device-memory regions.
    ///
    /// # Safety
    /// Same as [`Self::read`].
    pub unsafe fn copy(&self, src: *const u8, dst: *mut u8, len: usize) {
        // Safety: forwarded to the caller's contract above.
        unsafe { std::ptr::copy(src, dst, len) };
    }
}
