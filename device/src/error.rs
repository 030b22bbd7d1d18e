// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Two-tier error handling: caller-recoverable conditions flow out as a
//! plain `Result<T, DeviceError>`; resource exhaustion and
//! programmer-contract violations abort the process, since there is no
//! consistent state to unwind into once a group is mid-flight.

use std::fmt;

/// Recoverable conditions a caller can act on: a bad NDRange, an
/// oversized work-group, a double-shutdown. Never constructed for
/// conditions this crate considers fatal — see [`fatal`].
#[derive(Debug)]
pub enum DeviceError {
    /// `local_size` does not evenly divide `global_size` in some dimension.
    IndivisibleRange { dim: usize, global: usize, local: usize },
    /// `work_dim` is zero or exceeds 3.
    InvalidWorkDim(u32),
    /// `submit` called after `shutdown`.
    ShuttingDown,
    /// The NDRange's work-group size exceeds `DeviceConfig::max_work_group_size`.
    WorkGroupTooLarge { items_per_group: usize, max: usize },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndivisibleRange { dim, global, local } => write!(
                f,
                "global size {global} is not evenly divisible by local size {local} in dimension {dim}"
            ),
            Self::InvalidWorkDim(dim) => write!(f, "work_dim {dim} is out of range 1..=3"),
            Self::ShuttingDown => write!(f, "device is shutting down, cannot submit new kernels"),
            Self::WorkGroupTooLarge { items_per_group, max } => write!(
                f,
                "work-group of {items_per_group} items exceeds the configured maximum of {max}"
            ),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Abort the process with a diagnostic. Used for resource exhaustion and
/// programmer-contract violations (misaligned `switch_fiber` arguments,
/// null descriptors) per the error-handling design: these leave in-flight
/// work-groups in a state nothing can recover, so there is no `Result` path
/// for them.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort()
    }};
}
