// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! SysV64 context switch.
//!
//! `switch_fiber`/`exit_to` save/restore the callee-saved GPRs that aren't
//! already preserved across a `call` (`rbx`/`rbp`/`r12..r15`) by hand,
//! because `rbx`/`rbp` are LLVM-reserved and can't be named as `asm!`
//! clobbers, and `xmm0..xmm7` are always saved/restored since any of them
//! may hold live kernel state. `xmm0..xmm3` are additionally reloaded from
//! `regs` when present, covering the System V vector-argument registers a
//! kernel entry point may expect to find populated on every switch.
//!
//! `init_stack` (backing `make_fiber_with_ints`/`make_fiber_with_frame`)
//! writes the argument data plus a fake return address onto a fresh fiber's
//! stack so that jumping to its entry point behaves as if it had just been
//! `call`ed. SysV64 passes the first integer argument in `rdi`, so
//! `switch_fiber` loads it explicitly on every jump into `dest.pc` rather
//! than relying on the stack layout alone.
//!
//! `Fiber` is `#[repr(C)]` with `sp` at offset `0x00` and `pc` at offset
//! `0x08`; the offsets below must track that layout.

use crate::{Fiber, VectorRegs};
use core::arch::asm;

fn align_down(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

/// Lay out `data` at the top of `fiber`'s stack window and a fake return
/// address of `return_addr` directly below it, then point `fiber` at
/// `entry` with `sp` set so that jumping to `entry` looks exactly like
/// `entry` was just `call`ed with `data`'s address as its first argument:
/// the SysV64 ABI requires `rsp % 16 == 8` at function entry (the state
/// right after a `call` pushes a return address from a 16-aligned caller
/// frame), so `data`'s start address is rounded down to 16 first, and the
/// return-address slot sits in the 8 bytes directly below it.
///
/// `switch_fiber` loads `rdi = dest.sp + 8` before jumping to `dest.pc`,
/// which lands exactly on `data`'s start address here.
fn init_stack(fiber: &mut Fiber, entry: usize, return_addr: usize, data: &[u8]) {
    let top = fiber.stack_bottom + fiber.stack_size;
    let data_addr = align_down(top - data.len(), 16);
    let ra_slot = data_addr - 8;
    assert!(ra_slot >= fiber.stack_bottom, "argument data too large for stack window");

    // Safety: `data_addr..data_addr + data.len()` and the 8 bytes at
    // `ra_slot` both lie within `fiber`'s stack window, which the caller
    // owns exclusively for the fiber's whole lifetime.
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), data_addr as *mut u8, data.len());
        (ra_slot as *mut usize).write(return_addr);
    }

    fiber.sp = ra_slot;
    fiber.pc = entry;
}

/// # Safety
/// See [`crate::make_fiber_with_ints`].
pub unsafe fn make_fiber_with_ints(fiber: &mut Fiber, entry: usize, ints: &[usize]) {
    // Safety: `ints` is read in full before this function returns.
    let bytes = unsafe {
        core::slice::from_raw_parts(ints.as_ptr().cast::<u8>(), core::mem::size_of_val(ints))
    };
    // A zero return address so falling off the end of a fiber built this
    // way faults deterministically: this constructor is only ever used for
    // fibers that run forever (see `fiber::make_fiber_with_ints`'s doc
    // comment) and never fall through.
    init_stack(fiber, entry, 0, bytes);
}

/// # Safety
/// See [`crate::make_fiber_with_frame`].
pub unsafe fn make_fiber_with_frame(
    fiber: &mut Fiber,
    entry: usize,
    return_trampoline: usize,
    frame: &[u8],
) {
    init_stack(fiber, entry, return_trampoline, frame);
}

/// Save the running context into `current`, load `dest`'s saved context, and
/// resume it. After loading `dest.sp` this also points `rdi` just past the
/// saved-context slot on `dest`'s stack (`dest.sp + 8`) before jumping to
/// `dest.pc`: a freshly built fiber (whose `pc` is the kernel's real entry
/// point, not a resume label) receives this as its first argument, which is
/// exactly where `make_fiber_with_frame` copied the argument frame. A
/// resumed fiber ignores it — it resumes at the internal label below, which
/// doesn't reference `rdi`.
#[inline(never)]
pub unsafe fn switch_fiber(current: &mut Fiber, dest: &Fiber, regs: Option<&VectorRegs>) {
    let regs_ptr = regs.map_or(core::ptr::null(), |r| core::ptr::from_ref(r));

    // Safety: `current`/`dest` describe live fiber stacks per the caller
    // contract on `switch_fiber`; the asm below only ever reads/writes the
    // two `usize` fields at offsets 0x00/0x08 of each `Fiber` and the 16
    // bytes at a time under `regs_ptr`, which is checked 16-byte aligned by
    // the caller.
    unsafe {
        asm!(
            "push rbx",
            "push rbp",
            "push r12",
            "push r13",
            "push r14",
            "push r15",

            "sub rsp, 0x80",
            "movups [rsp + 0x00], xmm0",
            "movups [rsp + 0x10], xmm1",
            "movups [rsp + 0x20], xmm2",
            "movups [rsp + 0x30], xmm3",
            "movups [rsp + 0x40], xmm4",
            "movups [rsp + 0x50], xmm5",
            "movups [rsp + 0x60], xmm6",
            "movups [rsp + 0x70], xmm7",

            "test {regs}, {regs}",
            "je 2f",
            "movaps xmm0, [{regs} + 0x00]",
            "movaps xmm1, [{regs} + 0x10]",
            "movaps xmm2, [{regs} + 0x20]",
            "movaps xmm3, [{regs} + 0x30]",
            "2:",

            // current->sp <= rsp ; current->pc <= resume label (3)
            "mov [{current} + 0x00], rsp",
            "lea {tmp}, [rip + 3f]",
            "mov [{current} + 0x08], {tmp}",

            // rsp <= dest->sp ; rdi <= dest->sp + 8 ; jmp dest->pc
            "mov rsp, [{dest} + 0x00]",
            "lea rdi, [rsp + 0x08]",
            "jmp qword ptr [{dest} + 0x08]",

            "3:",
            "movups xmm0, [rsp + 0x00]",
            "movups xmm1, [rsp + 0x10]",
            "movups xmm2, [rsp + 0x20]",
            "movups xmm3, [rsp + 0x30]",
            "movups xmm4, [rsp + 0x40]",
            "movups xmm5, [rsp + 0x50]",
            "movups xmm6, [rsp + 0x60]",
            "movups xmm7, [rsp + 0x70]",
            "add rsp, 0x80",

            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbp",
            "pop rbx",

            current = in(reg) core::ptr::from_mut(current),
            dest = in(reg) core::ptr::from_ref(dest),
            regs = in(reg) regs_ptr,
            tmp = out(reg) _,
            clobber_abi("sysv64"),
        );
    }
}

/// One-way jump into `dest` without saving any context. Used by `exit_fiber`
/// in the `device` crate: a terminating work-item never resumes, so unlike
/// `switch_fiber` there is no state worth preserving.
#[inline(never)]
pub unsafe fn exit_to(dest: &Fiber) -> ! {
    // Safety: `dest` must describe a live context (the worker's own "main
    // fiber" slot), ensured by the caller.
    unsafe {
        asm!(
            "mov rsp, [{dest} + 0x00]",
            "jmp qword ptr [{dest} + 0x08]",
            dest = in(reg) core::ptr::from_ref(dest),
            options(noreturn),
        );
    }
}
