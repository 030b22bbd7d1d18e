// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::measurement::Measurement;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fiber::stack::StackSlab;
use fiber::{Fiber, exit_to, make_fiber_with_ints, switch_fiber};

const WINDOW_SIZE: usize = 64 * 1024;

thread_local! {
    static MAIN: std::cell::Cell<*const Fiber> = const { std::cell::Cell::new(std::ptr::null()) };
}

unsafe extern "C" fn ping_pong(_args: *const usize) {
    loop {
        // Safety: `MAIN` is set by the benchmark closure before any switch
        // into this fiber, and stays valid for its whole duration.
        unsafe { exit_to(&*MAIN.with(|m| m.get())) }
    }
}

/// Round-trip cost of one `switch_fiber` into a work-item and back, the
/// operation the work-group dispatcher performs once per work-item per
/// round.
fn fiber_switch<M: Measurement + 'static>(name: &str, c: &mut Criterion<M>) {
    let slab = StackSlab::new(WINDOW_SIZE, 1).unwrap();
    let mut main_fiber = Fiber::new(0, 0);
    let mut work_fiber = Fiber::new(slab.window_bottom(0), slab.window_size());

    MAIN.with(|m| m.set(core::ptr::from_ref(&main_fiber)));

    // Safety: `work_fiber`'s stack window is exclusively owned by this
    // benchmark for its whole duration.
    unsafe { make_fiber_with_ints(&mut work_fiber, ping_pong, &[]) };

    c.bench_function(name, |b| {
        b.iter(|| {
            // `ping_pong` never calls `switch_fiber` itself, only
            // `exit_to` — so `work_fiber`'s saved context is untouched by
            // each run and this restarts it fresh from its entry point
            // every iteration.
            // Safety: both fibers are live and owned exclusively by this
            // thread.
            unsafe { switch_fiber(&mut main_fiber, &work_fiber, None) };
            black_box(&work_fiber);
        })
    });
}

fn fiber_switch_time(c: &mut Criterion) {
    fiber_switch("fiber_switch_time", c);
}

criterion_group!(
    name = time;
    config = Criterion::default();
    targets = fiber_switch_time
);

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        use criterion_cycles_per_byte::CyclesPerByte;

        fn fiber_switch_cycles(c: &mut Criterion<CyclesPerByte>) {
            fiber_switch("fiber_switch_cycles", c);
        }

        criterion_group!(
            name = cycles;
            config = Criterion::default().with_measurement(CyclesPerByte);
            targets = fiber_switch_cycles
        );

        criterion_main!(cycles, time);
    } else {
        criterion_main!(time);
    }
}
