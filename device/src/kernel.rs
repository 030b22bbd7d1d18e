// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The compiled-kernel surface this engine consumes. Loading a kernel
//! binary and resolving its entry point are out of scope here (see the
//! scope note in the crate root); this is just the shape the launcher and
//! work-group setup need.

/// The signature every kernel entry point has: called with a byte pointer
/// to its argument frame (the same frame [`fiber::make_fiber_with_frame`]
/// copies onto the work-item's own stack), never returning normally —
/// falling off the end lands in the return trampoline (`exit_fiber`). The
/// frame itself is an array of machine words; kernels reinterpret the
/// pointer accordingly.
pub type KernelEntry = unsafe extern "C" fn(*const u8);

/// How one word of a kernel's argument frame is interpreted during
/// per-group setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// An ordinary by-value argument; copied through unchanged.
    Value,
    /// A group-local-memory argument. The frame word at this slot holds the
    /// requested allocation size (in bytes) in the NDRange's template frame;
    /// per-group setup replaces it with a pointer to a fresh allocation of
    /// that size, private to the group.
    LocalMemory,
}

/// Where one kernel parameter lives in the argument frame and how it should
/// be treated when a work-group's private frame copy is built.
#[derive(Debug, Clone, Copy)]
pub struct ParamLayout {
    pub kind: ParamKind,
    /// Offset into the frame, in `usize`-sized words — the frame is an
    /// array of machine words.
    pub word_offset: usize,
}

/// A compiled kernel, already loaded and linked by whatever sits above this
/// engine.
pub struct Kernel {
    pub entry: KernelEntry,
    pub params: Vec<ParamLayout>,
    /// Group-local memory the kernel itself declares a fixed size for
    /// (e.g. a `__local` variable with a compile-time-known extent), as
    /// opposed to a *parameter* typed local memory whose size is supplied
    /// per launch. Zero means the kernel declares none.
    pub local_reserved_bytes: usize,
}

impl Kernel {
    pub fn new(entry: KernelEntry) -> Self {
        Self { entry, params: Vec::new(), local_reserved_bytes: 0 }
    }

    pub fn with_params(mut self, params: Vec<ParamLayout>) -> Self {
        self.params = params;
        self
    }

    pub fn with_local_reserved_bytes(mut self, bytes: usize) -> Self {
        self.local_reserved_bytes = bytes;
        self
    }

    /// Number of machine words a per-work-item argument frame needs to hold
    /// every declared parameter.
    pub fn frame_words(&self) -> usize {
        self.params.iter().map(|p| p.word_offset + 1).max().unwrap_or(0)
    }
}
