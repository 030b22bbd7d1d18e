// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Portable fallback context switch for architectures we don't hand-write
//! assembly for, built on the POSIX `ucontext` family (`getcontext`/
//! `makecontext`/`swapcontext`/`setcontext`) at the cost of performance
//! relative to the hand-rolled `x86_64` path.
//!
//! Unlike the `x86_64` backend, `Fiber::sp` here is not a hardware stack
//! pointer: it is the address of a heap-allocated [`UcontextState`] that owns
//! the `ucontext_t`. `regs` (the vector-register reload) is not honoured on
//! this path — `swapcontext` makes no ABI guarantee about vector register
//! state, so there is nothing safe to reload here. Kernels that rely on the
//! vector-argument reload are an `x86_64`-only optimization; portable
//! kernels must not depend on it.

use crate::{Fiber, VectorRegs};
use std::boxed::Box;

struct UcontextState {
    ctx: libc::ucontext_t,
    /// Function to jump to when `run`'s entry point returns normally, the
    /// same role the fake return address `x86_64::init_stack` writes onto
    /// the real stack plays there. Zero for fibers built with
    /// `make_fiber_with_ints`, which are never meant to return.
    return_trampoline: usize,
    run: Option<RunKind>,
}

enum RunKind {
    Ints { entry: usize, args: Box<[usize]> },
    Frame { entry: usize, frame: Box<[u8]> },
}

/// # Safety
/// See [`crate::make_fiber_with_ints`].
pub unsafe fn make_fiber_with_ints(fiber: &mut Fiber, entry: usize, ints: &[usize]) {
    let state = Box::new(UcontextState {
        // Safety: `ucontext_t` is a plain data struct; zeroed is a valid
        // (if meaningless until `getcontext`) initial value.
        ctx: unsafe { std::mem::zeroed() },
        return_trampoline: 0,
        run: Some(RunKind::Ints { entry, args: ints.into() }),
    });
    init_common(fiber, state);
}

/// # Safety
/// See [`crate::make_fiber_with_frame`].
pub unsafe fn make_fiber_with_frame(
    fiber: &mut Fiber,
    entry: usize,
    return_trampoline: usize,
    frame: &[u8],
) {
    let state = Box::new(UcontextState {
        // Safety: see above.
        ctx: unsafe { std::mem::zeroed() },
        return_trampoline,
        run: Some(RunKind::Frame { entry, frame: frame.into() }),
    });
    init_common(fiber, state);
}

fn init_common(fiber: &mut Fiber, mut state: Box<UcontextState>) {
    // Safety: `state.ctx` is a valid (if not-yet-made) ucontext_t and
    // `stack_bottom`/`stack_size` describe memory exclusively owned by this
    // fiber for its whole lifetime.
    unsafe {
        let rc = libc::getcontext(&mut state.ctx);
        assert_eq!(rc, 0, "getcontext failed");

        state.ctx.uc_stack.ss_sp = fiber.stack_bottom as *mut libc::c_void;
        state.ctx.uc_stack.ss_size = fiber.stack_size;
        state.ctx.uc_link = std::ptr::null_mut();

        let raw = Box::into_raw(state);
        let addr = raw as usize;
        #[allow(clippy::cast_possible_truncation, reason = "splitting a pointer into two u32 halves for makecontext's int-only varargs is intentional")]
        let hi = (addr >> 32) as u32;
        #[allow(clippy::cast_possible_truncation, reason = "see hi above")]
        let lo = (addr & 0xffff_ffff) as u32;

        #[allow(clippy::missing_transmute_annotations, reason = "libc's makecontext is inherently this unsafe")]
        let entry_fn: extern "C" fn() = std::mem::transmute(trampoline as extern "C" fn(u32, u32));
        libc::makecontext(&mut (*raw).ctx, entry_fn, 2, hi, lo);

        fiber.sp = raw as usize;
        fiber.pc = 0;
    }
}

extern "C" fn trampoline(hi: u32, lo: u32) {
    let addr = ((hi as usize) << 32) | (lo as usize);
    // Safety: `addr` was produced by `Box::into_raw` in `init_common` and is
    // only ever resumed into once, by `swapcontext`.
    let mut state = unsafe { Box::from_raw(addr as *mut UcontextState) };
    let return_trampoline = state.return_trampoline;
    let run = state.run.take().expect("fiber run state consumed twice");

    match run {
        RunKind::Ints { entry, args } => {
            // Safety: `entry` was supplied by the caller of
            // `make_fiber_with_ints` as a function pointer of this shape.
            let f: unsafe extern "C" fn(*const usize) = unsafe { std::mem::transmute(entry) };
            // Safety: see above; `args` stays alive for the call. `state`
            // (and so `state.ctx`) stays alive across every `swapcontext`
            // this call makes, since `current.sp` keeps pointing at it.
            unsafe { f(args.as_ptr()) };
        }
        RunKind::Frame { entry, frame } => {
            // Safety: `entry` was supplied by the caller of
            // `make_fiber_with_frame` as a function pointer of this shape.
            let f: unsafe extern "C" fn(*const u8) = unsafe { std::mem::transmute(entry) };
            // Safety: see above; `frame` stays alive for the call.
            unsafe { f(frame.as_ptr()) };
        }
    }

    // The entry point above has returned (or, for `make_fiber_with_ints`
    // fibers that are contractually never supposed to, fallen through
    // anyway). Nothing will switch into or out of this fiber again, so this
    // is the last point at which `state` can be freed without racing a
    // `swapcontext` that expects `current.sp` to stay live — drop it now
    // rather than leaking it on the `return_trampoline` jump below, which
    // never returns control here.
    drop(state);

    if return_trampoline != 0 {
        // Safety: `return_trampoline`, if set, is a valid never-returning
        // function pointer per `make_fiber_with_frame`'s contract.
        let f: unsafe extern "C" fn() -> ! = unsafe { std::mem::transmute(return_trampoline) };
        // Safety: see above.
        unsafe { f() }
    }
}

/// # Safety
/// See [`crate::switch_fiber`]. `regs` is accepted for API parity but is a
/// no-op on this backend (see module docs).
pub unsafe fn switch_fiber(current: &mut Fiber, dest: &Fiber, _regs: Option<&VectorRegs>) {
    // Safety: `current.sp`/`dest.sp` were produced by `init_common` and
    // point at live `UcontextState`s owned by their respective fibers.
    unsafe {
        let current_ctx = &mut (*(current.sp as *mut UcontextState)).ctx;
        let dest_ctx = &(*(dest.sp as *const UcontextState)).ctx;
        let rc = libc::swapcontext(current_ctx, dest_ctx);
        assert_eq!(rc, 0, "swapcontext failed");
    }
}

/// # Safety
/// See [`crate::arch::exit_to`].
pub unsafe fn exit_to(dest: &Fiber) -> ! {
    // Safety: `dest.sp` points at a live `UcontextState`.
    unsafe {
        let dest_ctx = &(*(dest.sp as *const UcontextState)).ctx;
        libc::setcontext(dest_ctx);
    }
    unreachable!("setcontext does not return")
}
