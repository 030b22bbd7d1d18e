// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Device coordinator configuration. No file or CLI surface — callers build
//! one of these directly.

/// Defaults: an 8 KiB per-item stack window (see [`crate::window`]), a
/// 1024-item maximum work-group size, and 16-byte allocation alignment (the
/// widest vector type's natural alignment on every target this crate
/// supports).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Number of worker threads to start. `None` uses the host's detected
    /// core count (see [`crate::cpu::count`]).
    pub num_workers: Option<usize>,
    /// Maximum items any single work-group may contain; rejected at
    /// submission time if exceeded.
    pub max_work_group_size: usize,
    /// Alignment, in bytes, that [`crate::device::Device::alloc`] guarantees
    /// for every allocation.
    pub mem_base_addr_align: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { num_workers: None, max_work_group_size: 1024, mem_base_addr_align: 16 }
    }
}
