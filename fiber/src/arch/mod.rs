// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{exit_to, make_fiber_with_frame, make_fiber_with_ints, switch_fiber};
    } else {
        mod fallback;
        pub use fallback::{exit_to, make_fiber_with_frame, make_fiber_with_ints, switch_fiber};
    }
}

/// Reads the live stack pointer register.
///
/// Used by [`crate::locate`] to implement the stack-mask trick. On
/// architectures we don't special-case below, this falls back to the address
/// of a stack-local variable, which lies in the same slab window as the real
/// stack pointer for any stack frame small relative to the slab size (true
/// for every call site in this crate and `device`).
#[inline(always)]
pub fn current_stack_pointer() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            let sp: usize;
            // Safety: reading rsp has no side effects.
            unsafe {
                core::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
            }
            sp
        } else if #[cfg(target_arch = "aarch64")] {
            let sp: usize;
            // Safety: reading sp has no side effects.
            unsafe {
                core::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
            }
            sp
        } else if #[cfg(any(target_arch = "riscv64", target_arch = "riscv32"))] {
            let sp: usize;
            // Safety: reading sp (x2) has no side effects.
            unsafe {
                core::arch::asm!("mv {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
            }
            sp
        } else {
            let probe = 0_u8;
            core::ptr::addr_of!(probe) as usize
        }
    }
}
