// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The stack-mask alignment boundary, shared between
//! [`crate::workgroup::WorkGroupControlBlock`] (which allocates windows of
//! this size) and [`crate::barrier::barrier`] (which masks a live stack
//! pointer down to this boundary to find the enclosing one).
//!
//! This has to be one process-wide constant rather than a per-group
//! setting: `barrier()` has no way to learn a group's window size before
//! it has located the group, and locating the group is exactly what the
//! mask computation does.

pub const STACK_WINDOW_SIZE: usize = 8192;
