// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single contiguous, power-of-two-aligned allocation subdivided into
//! fixed-size "windows", one per fiber.
//!
//! This is deliberately not one `mmap` per fiber (as a general-purpose fiber
//! library would do, see e.g. corosensei): the stack-mask locate trick (see
//! [`crate::locate`]) requires that masking any live stack pointer down to
//! the slab's alignment boundary always lands on a window belonging to
//! *this* work-group, which only holds if every window in a group comes from
//! one allocation carved up uniformly.

use std::alloc::{self, Layout};
use std::io;

/// One allocation holding `windows` fixed-size, `window_size`-aligned stacks
/// back to back. `window_size` must be a power of two; every window is then
/// also aligned to `window_size`, satisfying the stack-mask invariant for
/// each of them independently.
pub struct StackSlab {
    base: *mut u8,
    layout: Layout,
    window_size: usize,
    windows: usize,
}

// Safety: `StackSlab` is a plain owned allocation; the raw pointer is never
// aliased outside of the windows we hand out, and those are only ever
// touched by the worker thread that owns this slab.
unsafe impl Send for StackSlab {}

impl StackSlab {
    /// Allocate a slab of `windows` stacks of `window_size` bytes each,
    /// aligned to `window_size`.
    pub fn new(window_size: usize, windows: usize) -> io::Result<Self> {
        assert!(window_size.is_power_of_two(), "window_size must be a power of two");
        assert!(windows > 0, "a stack slab needs at least one window");

        let total = window_size
            .checked_mul(windows)
            .expect("stack slab size overflowed usize");
        let layout =
            Layout::from_size_align(total, window_size).expect("invalid stack slab layout");

        // Safety: `layout` has a non-zero size, checked above via `windows > 0`.
        let base = unsafe { alloc::alloc(layout) };
        if base.is_null() {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        }

        Ok(Self { base, layout, window_size, windows })
    }

    /// Number of windows in this slab.
    pub fn windows(&self) -> usize {
        self.windows
    }

    /// Size in bytes of each window, including whatever the caller carves
    /// off the top for per-item metadata.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Lowest address of window `index`.
    pub fn window_bottom(&self, index: usize) -> usize {
        assert!(index < self.windows, "stack window index out of range");
        // Safety: within the allocation, offset fits in isize since the
        // whole allocation does.
        (self.base as usize) + index * self.window_size
    }
}

impl Drop for StackSlab {
    fn drop(&mut self) {
        // Safety: `base`/`layout` are exactly what we passed to `alloc`.
        unsafe { alloc::dealloc(self.base, self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_are_aligned_and_contiguous() {
        let slab = StackSlab::new(8192, 4).unwrap();
        for i in 0..4 {
            let bottom = slab.window_bottom(i);
            assert_eq!(bottom % 8192, 0);
        }
        assert_eq!(slab.window_bottom(1) - slab.window_bottom(0), 8192);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two() {
        StackSlab::new(100, 2).unwrap();
    }
}
