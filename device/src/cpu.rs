// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! CPU topology discovery and thread affinity: one worker thread pinned to
//! each logical core.

use std::fs;

/// Number of logical cores to pin workers to.
///
/// On Linux this counts `processor` entries in `/proc/cpuinfo`; everywhere
/// else (and if `/proc/cpuinfo` can't be read) it falls back to
/// [`std::thread::available_parallelism`].
pub fn count() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            match fs::read_to_string("/proc/cpuinfo") {
                Ok(contents) => {
                    let n = contents.lines().filter(|l| l.starts_with("processor")).count();
                    if n > 0 {
                        return n;
                    }
                    log::warn!("/proc/cpuinfo had no processor entries, falling back");
                }
                Err(err) => log::warn!("failed to read /proc/cpuinfo: {err}, falling back"),
            }
            fallback_count()
        } else {
            fallback_count()
        }
    }
}

fn fallback_count() -> usize {
    std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(1)
}

/// Pin the calling thread to logical core `core`.
///
/// Best-effort off Linux: affinity is a performance property, not a
/// correctness one, for this engine (every worker is otherwise
/// interchangeable), so a platform without an affinity API just runs
/// unpinned.
pub fn pin_current_thread_to_core(core: usize) {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            // Safety: `set` is a plain stack value we fully initialize
            // before use and only pass by reference to libc.
            unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                libc::CPU_SET(core, &mut set);
                let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
                if rc != 0 {
                    log::warn!("sched_setaffinity failed for core {core}: {}", std::io::Error::last_os_error());
                }
            }
        } else {
            let _ = core;
        }
    }
}
