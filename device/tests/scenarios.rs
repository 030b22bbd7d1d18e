// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios S1-S6 over the full worker pool. Every kernel here
//! is a tiny `unsafe extern "C" fn` built by hand, standing in for what a
//! real kernel compiler would emit — the point of these tests is the
//! engine driving them, not the kernels themselves.

use std::sync::atomic::{AtomicUsize, Ordering};

use device::kernel::{Kernel, ParamKind, ParamLayout};
use device::ndrange::NDRange;
use device::{Device, DeviceConfig};

fn call_barrier(item: &device::WorkItemData) {
    // Safety: `item` is the calling fiber's own metadata block; its
    // `barrier_func` was filled in by `per_group_setup` and is always the
    // process barrier entry point.
    let f = unsafe { *item.barrier_func };
    // Safety: the barrier has no preconditions beyond being called from a
    // fiber the dispatch loop is driving, which every kernel here is.
    unsafe { f(0) };
}

/// # Safety
/// Must only be called from inside a kernel body.
unsafe fn current_item<'a>() -> &'a device::WorkItemData {
    // Safety: forwarded to the caller's contract above.
    unsafe { &*device::workitem::current() }
}

unsafe extern "C" fn identity_kernel(frame: *const u8) {
    let frame = frame.cast::<usize>();
    // Safety: word 0 of this kernel's frame is always the `out` pointer.
    let out = unsafe { *frame } as *mut usize;
    let item = unsafe { current_item() };
    // Safety: `out` has `global_size[0]` elements, and `global_id[0]` is in range.
    unsafe { *out.add(item.global_id[0]) = item.global_id[0] };
}

#[test]
fn s1_identity_kernel_1d() {
    let device = Device::new(DeviceConfig { num_workers: Some(2), ..Default::default() });
    let mut out = vec![0usize; 8];

    let kernel = Kernel::new(identity_kernel).with_params(vec![ParamLayout { kind: ParamKind::Value, word_offset: 0 }]);
    let ndrange = NDRange::new(1, [8, 1, 1], [4, 1, 1], [0, 0, 0]).unwrap();
    assert_eq!(ndrange.num_groups(), 2);

    let frame = vec![out.as_mut_ptr() as usize];
    device.submit(kernel, ndrange, frame, None).unwrap();
    device.shutdown();

    assert_eq!(out, vec![0, 1, 2, 3, 4, 5, 6, 7]);
}

unsafe extern "C" fn barrier_reduction_kernel(frame: *const u8) {
    let frame = frame.cast::<usize>();
    // Safety: word 0 is `out`.
    let out = unsafe { *frame } as *mut usize;
    let item = unsafe { current_item() };
    let scratch = item.local_reserved.cast::<usize>();
    // Safety: `scratch` holds 4 `usize`s reserved per group, `local_id[0]`
    // is in `0..4`.
    unsafe { scratch.add(item.local_id[0]).write(item.local_id[0]) };
    call_barrier(item);
    if item.local_id[0] == 0 {
        // Safety: every other item already wrote its slot before this
        // barrier returned.
        let sum: usize = (0..4).map(|i| unsafe { scratch.add(i).read() }).sum();
        // Safety: one group, one output slot.
        unsafe { *out = sum };
    }
}

#[test]
fn s2_barrier_reduction() {
    let device = Device::new(DeviceConfig { num_workers: Some(2), ..Default::default() });
    let mut out = vec![0usize; 1];

    let kernel = Kernel::new(barrier_reduction_kernel)
        .with_params(vec![ParamLayout { kind: ParamKind::Value, word_offset: 0 }])
        .with_local_reserved_bytes(4 * std::mem::size_of::<usize>());
    let ndrange = NDRange::new(1, [4, 1, 1], [4, 1, 1], [0, 0, 0]).unwrap();

    let frame = vec![out.as_mut_ptr() as usize];
    device.submit(kernel, ndrange, frame, None).unwrap();
    device.shutdown();

    assert_eq!(out[0], 6);
}

unsafe extern "C" fn double_barrier_kernel(frame: *const u8) {
    let frame = frame.cast::<usize>();
    // Safety: word 0 is `out`.
    let out = unsafe { *frame } as *mut usize;
    let item = unsafe { current_item() };
    let scratch = item.local_reserved.cast::<usize>();
    let lid = item.local_id[0];
    // Safety: 4 reserved words, `lid` in `0..4`.
    unsafe { scratch.add(lid).write(lid) };
    call_barrier(item);
    // Safety: all 4 slots were written before this barrier returned.
    let next = unsafe { scratch.add((lid + 1) % 4).read() };
    // Safety: only this item writes its own slot from here on.
    unsafe { scratch.add(lid).write(next) };
    call_barrier(item);
    // Safety: every item's second write happened before this barrier
    // returned.
    let val = unsafe { scratch.add(lid).read() };
    // Safety: `out` has one slot per item.
    unsafe { *out.add(lid) = val };
}

#[test]
fn s3_double_barrier_round_robin_fairness() {
    let device = Device::new(DeviceConfig { num_workers: Some(2), ..Default::default() });
    let mut out = vec![0usize; 4];

    let kernel = Kernel::new(double_barrier_kernel)
        .with_params(vec![ParamLayout { kind: ParamKind::Value, word_offset: 0 }])
        .with_local_reserved_bytes(4 * std::mem::size_of::<usize>());
    let ndrange = NDRange::new(1, [4, 1, 1], [4, 1, 1], [0, 0, 0]).unwrap();

    let frame = vec![out.as_mut_ptr() as usize];
    device.submit(kernel, ndrange, frame, None).unwrap();
    device.shutdown();

    assert_eq!(out, vec![1, 2, 3, 0]);
}

unsafe extern "C" fn local_mem_isolation_kernel(frame: *const u8) {
    let frame = frame.cast::<usize>();
    // Safety: word 0 is `out`, word 1 is the local-memory parameter pointer.
    let out = unsafe { *frame } as *mut usize;
    let local = unsafe { *frame.add(1) } as *mut usize;
    let item = unsafe { current_item() };
    if item.local_id[0] == 0 {
        // Safety: the parameter was requested with at least one word.
        unsafe { local.write(item.group_id[0]) };
    }
    call_barrier(item);
    // Safety: the write above happened-before this barrier returned.
    let val = unsafe { local.read() };
    // Safety: `out` has `global_size[0]` elements.
    unsafe { *out.add(item.global_id[0]) = val };
}

#[test]
fn s4_multi_group_local_memory_isolation() {
    let device = Device::new(DeviceConfig { num_workers: Some(4), ..Default::default() });
    let mut out = vec![0usize; 8];

    let kernel = Kernel::new(local_mem_isolation_kernel).with_params(vec![
        ParamLayout { kind: ParamKind::Value, word_offset: 0 },
        ParamLayout { kind: ParamKind::LocalMemory, word_offset: 1 },
    ]);
    let ndrange = NDRange::new(1, [8, 1, 1], [4, 1, 1], [0, 0, 0]).unwrap();

    let frame = vec![out.as_mut_ptr() as usize, 16];
    device.submit(kernel, ndrange, frame, None).unwrap();
    device.shutdown();

    assert_eq!(out, vec![0, 0, 0, 0, 1, 1, 1, 1]);
}

unsafe extern "C" fn indexing_2d_kernel(frame: *const u8) {
    let frame = frame.cast::<usize>();
    // Safety: word 0 is `out`.
    let out = unsafe { *frame } as *mut usize;
    let item = unsafe { current_item() };
    let idx = item.global_id[1] * 4 + item.global_id[0];
    // Safety: `out` has 16 elements, `idx` is in `0..16`.
    unsafe { *out.add(idx) = idx };
}

#[test]
fn s5_2d_indexing() {
    let device = Device::new(DeviceConfig { num_workers: Some(3), ..Default::default() });
    let mut out = vec![0usize; 16];

    let kernel = Kernel::new(indexing_2d_kernel).with_params(vec![ParamLayout { kind: ParamKind::Value, word_offset: 0 }]);
    let ndrange = NDRange::new(2, [4, 4, 1], [2, 2, 1], [0, 0, 0]).unwrap();

    let frame = vec![out.as_mut_ptr() as usize];
    device.submit(kernel, ndrange, frame, None).unwrap();
    device.shutdown();

    for i in 0..16 {
        assert_eq!(out[i], i);
    }
}

#[test]
fn s6_worker_count_sanity() {
    let device = Device::new(DeviceConfig { num_workers: Some(5), ..Default::default() });
    assert_eq!(device.preferred_workgroup_count(), 5);
    device.shutdown();
}

unsafe extern "C" fn count_items_kernel(frame: *const u8) {
    let frame = frame.cast::<usize>();
    // Safety: word 0 is a pointer to a shared `AtomicUsize` counter.
    let counter = unsafe { &*(*frame as *const AtomicUsize) };
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Submitting many small kernels back-to-back must account for every item
/// exactly once (invariant 2), across repeated submissions on the same
/// pool.
#[test]
fn repeated_submissions_account_for_every_item() {
    let device = Device::new(DeviceConfig { num_workers: Some(4), ..Default::default() });

    for _ in 0..20 {
        let counter = AtomicUsize::new(0);
        let kernel =
            Kernel::new(count_items_kernel).with_params(vec![ParamLayout { kind: ParamKind::Value, word_offset: 0 }]);
        let ndrange = NDRange::new(1, [64, 1, 1], [8, 1, 1], [0, 0, 0]).unwrap();
        let frame = vec![std::ptr::from_ref(&counter) as usize];
        device.submit(kernel, ndrange, frame, None).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    device.shutdown();
}
