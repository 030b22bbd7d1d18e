// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Aligned stack slabs and raw context switches for cooperative, round-robin
//! work-item scheduling.
//!
//! This crate is the architecture-dependent primitive underneath `device`'s
//! work-group scheduler: a [`Fiber`] is a saved `(stack pointer, program
//! counter)` pair, built fresh over a caller-owned stack window with
//! [`make_fiber_with_ints`] or [`make_fiber_with_frame`], and resumed with
//! [`switch_fiber`]. There is no scheduler here and no notion of "the current
//! fiber" — callers drive switching themselves, exactly as the work-group
//! dispatcher in `device` does.
//!
//! The one non-obvious piece is [`locate`]: because many fibers share a
//! single OS thread, there is no thread-local storage to hang per-fiber data
//! off of. Instead every fiber's stack window is carved out of one
//! [`stack::StackSlab`] aligned to the window size, so masking any live
//! stack pointer down to that alignment always recovers the window's base,
//! and a fixed offset from there recovers whatever the caller stashed there.

mod arch;
pub mod stack;

use std::mem;

/// A saved execution context: a stack pointer and a resume address.
///
/// The fields are `pub` for the benefit of [`make_fiber_with_ints`] and
/// [`make_fiber_with_frame`] callers that need to place the structure
/// in caller-controlled memory (e.g. at a fixed offset inside a work-item's
/// metadata block), but their bit patterns are only meaningful to this
/// crate's `arch` backend — never read or write them from outside it.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Fiber {
    /// Architecture-defined: a raw stack pointer on `x86_64`, an opaque
    /// heap-state token on the portable fallback.
    pub sp: usize,
    /// Architecture-defined: a resume address on `x86_64`, unused (always
    /// zero) on the portable fallback.
    pub pc: usize,
    /// Lowest address of the stack window this fiber was built over.
    pub stack_bottom: usize,
    /// Size in bytes of the stack window.
    pub stack_size: usize,
}

impl Fiber {
    /// A fiber descriptor for a stack window that hasn't been built yet, or
    /// for the "main fiber" slot a worker switches away from and back into
    /// (which never needs `make_fiber_with_*` — its context is captured by
    /// the first `switch_fiber` call that leaves it).
    pub fn new(stack_bottom: usize, stack_size: usize) -> Self {
        Self { sp: 0, pc: 0, stack_bottom, stack_size }
    }
}

/// Four 128-bit vector registers, reloaded into `xmm0..xmm3` on every
/// `x86_64` [`switch_fiber`] when supplied. This is how scalar and vector
/// kernel arguments that live in registers across the lifetime of a
/// work-group are re-established on each work-item resume; see the
/// `x86_64` backend docs for the exact contract. Ignored entirely on the
/// portable fallback backend.
#[repr(C, align(16))]
#[derive(Debug, Default, Clone, Copy)]
pub struct VectorRegs(pub [u128; 4]);

/// Build `fiber` to run `entry` on first resume, passing `ints` as a
/// pointer to an array of integer arguments (`rdi` on `x86_64`).
///
/// `entry` must have the signature `unsafe extern "C" fn(*const usize)` and
/// never return: every caller of this constructor only ever wraps
/// work-item bodies that loop until they exit a fiber explicitly, so there
/// is no return path to invent here.
///
/// # Safety
/// `fiber.stack_bottom..+stack_size` must be live, exclusively owned,
/// writable memory for as long as `fiber` might be switched into, and
/// `entry` must be a valid function pointer of the stated signature.
pub unsafe fn make_fiber_with_ints(fiber: &mut Fiber, entry: unsafe extern "C" fn(*const usize), ints: &[usize]) {
    // Safety: forwarded to the caller's contract above.
    unsafe { arch::make_fiber_with_ints(fiber, entry as usize, ints) }
}

/// Build `fiber` to run `entry` on first resume, with `frame` copied onto
/// the fiber's own stack and passed by reference (`rdi` on `x86_64`). A fake
/// return address pointing at `return_trampoline` is placed directly below
/// the frame, exactly where a real `call entry` would have left one — so
/// when `entry` returns normally, execution continues in
/// `return_trampoline` instead of falling off the end of the stack.
///
/// This is the path the work-group launcher uses: `frame` is the NDRange's
/// per-work-item argument block, rebuilt fresh for every work-group, and
/// `return_trampoline` is the kernel exit routine that locates the group's
/// control block and switches back to the worker's main fiber.
///
/// # Safety
/// Same as [`make_fiber_with_ints`], plus `return_trampoline` must be a
/// valid function pointer that never returns.
pub unsafe fn make_fiber_with_frame(
    fiber: &mut Fiber,
    entry: unsafe extern "C" fn(*const u8),
    return_trampoline: unsafe extern "C" fn() -> !,
    frame: &[u8],
) {
    // Safety: forwarded to the caller's contract above.
    unsafe {
        arch::make_fiber_with_frame(fiber, entry as usize, return_trampoline as usize, frame)
    }
}

/// Save the caller's context into `current` and resume `dest`. `regs`, when
/// present, is reloaded into the vector registers on backends that support
/// it (see [`VectorRegs`]).
///
/// Control returns from this call only once some other `switch_fiber` call
/// targets `current` again.
///
/// # Safety
/// `current` must describe the context actually executing this call (not
/// some other fiber's descriptor), and `dest` must describe a context
/// previously saved by `switch_fiber` or built by `make_fiber_with_ints` /
/// `make_fiber_with_frame` and not currently running anywhere else. If
/// `regs` is `Some`, it must be 16-byte aligned — violating this is a
/// programmer error this crate does not try to recover from.
pub unsafe fn switch_fiber(current: &mut Fiber, dest: &Fiber, regs: Option<&VectorRegs>) {
    if let Some(r) = regs {
        let addr = core::ptr::from_ref(r) as usize;
        assert_eq!(addr % mem::align_of::<VectorRegs>(), 0, "vector register block must be 16-byte aligned");
    }
    // Safety: forwarded to the caller's contract above.
    unsafe { arch::switch_fiber(current, dest, regs) }
}

/// Jump into `dest` without saving the caller's context anywhere. Used by a
/// work-item that is exiting for good and will never be resumed.
///
/// # Safety
/// `dest` must describe a live, not-currently-running context.
pub unsafe fn exit_to(dest: &Fiber) -> ! {
    // Safety: forwarded to the caller's contract above.
    unsafe { arch::exit_to(dest) }
}

/// Recover a pointer stashed at `offset` bytes from the top of the
/// `align`-aligned stack window enclosing the caller's own stack pointer.
///
/// `offset` is relative to the window's *top* (`window_bottom + align`), and
/// is expected to be negative: callers reserve the last bytes of each window
/// for this data and mask the live stack pointer down to the window's base
/// to recover it, with no thread-local storage involved.
///
/// # Safety
/// The caller must actually be executing on a stack that was carved out of
/// a [`stack::StackSlab`] with window size `align`, and a valid `T` must
/// have been written at `offset` bytes from that window's top before this
/// is called.
pub unsafe fn locate<T>(align: usize, offset: isize) -> *mut T {
    debug_assert!(align.is_power_of_two());
    let sp = arch::current_stack_pointer();
    let top = (sp + align) & !(align - 1);
    // Safety: forwarded to the caller's contract above; `top` is within the
    // enclosing window's allocation by construction.
    unsafe { top.checked_add_signed(offset).expect("locate offset overflowed") as *mut T }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackSlab;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn bump_and_exit(args: *const usize) {
        // Safety: `ints` below is a 1-element array, kept alive by the
        // caller until the fiber exits.
        let n = unsafe { *args };
        COUNTER.fetch_add(n, Ordering::SeqCst);
        // Safety: test-only return path, `MAIN` is valid for the test's
        // duration.
        unsafe { exit_to(&*MAIN.with(|m| m.get())) }
    }

    thread_local! {
        static MAIN: std::cell::Cell<*const Fiber> = const { std::cell::Cell::new(std::ptr::null()) };
    }

    #[test]
    fn switch_into_fresh_fiber_and_back() {
        COUNTER.store(0, Ordering::SeqCst);

        let slab = StackSlab::new(64 * 1024, 1).unwrap();
        let bottom = slab.window_bottom(0);
        let size = slab.window_size();

        let mut main_fiber = Fiber::new(0, 0);
        let mut work_fiber = Fiber::new(bottom, size);

        let ints = [41usize];
        // Safety: `work_fiber`'s stack window is exclusively owned here and
        // outlives the switch below.
        unsafe { make_fiber_with_ints(&mut work_fiber, bump_and_exit, &ints) };

        MAIN.with(|m| m.set(core::ptr::from_ref(&main_fiber)));

        // Safety: both fibers are live and not running elsewhere.
        unsafe { switch_fiber(&mut main_fiber, &work_fiber, None) };

        assert_eq!(COUNTER.load(Ordering::SeqCst), 41);
    }

    // Returns normally, unlike `bump_and_exit` — this exercises the fake
    // return-address mechanism in `make_fiber_with_frame` rather than
    // calling `exit_to` directly.
    unsafe extern "C" fn copy_frame_and_return(frame: *const u8) {
        // Safety: caller copied an 8-byte little-endian usize here.
        let bytes: [u8; 8] = unsafe { core::slice::from_raw_parts(frame, 8).try_into().unwrap() };
        COUNTER.fetch_add(usize::from_le_bytes(bytes), Ordering::SeqCst);
    }

    unsafe extern "C" fn return_trampoline() -> ! {
        // Safety: `MAIN` is set by the test before the first switch into
        // the fiber that can reach this trampoline.
        unsafe { exit_to(&*MAIN.with(|m| m.get())) }
    }

    #[test]
    fn switch_into_fiber_with_frame() {
        COUNTER.store(0, Ordering::SeqCst);

        let slab = StackSlab::new(64 * 1024, 1).unwrap();
        let mut main_fiber = Fiber::new(0, 0);
        let mut work_fiber = Fiber::new(slab.window_bottom(0), slab.window_size());

        MAIN.with(|m| m.set(core::ptr::from_ref(&main_fiber)));

        let frame = 7_usize.to_le_bytes();
        // Safety: stack window is exclusively owned, `return_trampoline`
        // never returns.
        unsafe {
            make_fiber_with_frame(&mut work_fiber, copy_frame_and_return, return_trampoline, &frame)
        };

        // Safety: both fibers live, neither running elsewhere.
        unsafe { switch_fiber(&mut main_fiber, &work_fiber, None) };

        assert_eq!(COUNTER.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn stack_mask_formula_recovers_window_top() {
        // `locate` itself reads the *calling thread's* stack pointer, which
        // in a unit test is not actually inside a StackSlab window — so we
        // check the masking arithmetic it's built on directly instead.
        let slab = StackSlab::new(8192, 3).unwrap();
        for i in 0..3 {
            let bottom = slab.window_bottom(i);
            let probe_sp = bottom + 128; // anywhere within the window
            let top = (probe_sp + slab.window_size()) & !(slab.window_size() - 1);
            assert_eq!(top, bottom + slab.window_size());
        }
    }
}
