// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slot control plane hot-path benchmarks.
//!
//! Measures `allocate_next_slot` / `reference_next_event` /
//! `dereference_event` latency in isolation from any shared-memory transport
//! or payload I/O — the "wait-free bounded" claims in the spec this crate
//! implements are about these three operations specifically.

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_precision_loss)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use hdds_shm_events::atomic::RealAtomic;
use hdds_shm_events::transaction_log::SubscriberId;
use hdds_shm_events::EventDataControl;
use std::hint::black_box as bb;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_name(tag: &str) -> String {
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    format!("/hdds_shm_events_bench_{tag}_{ts}")
}

/// Steady-state `allocate_next_slot` -> `event_ready`: every allocation
/// immediately republishes so the array never runs dry and the scan always
/// finds a candidate on its first pass.
fn bench_allocate_steady_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_next_slot");

    for max_slots in [8u16, 64, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(max_slots), &max_slots, |b, &max_slots| {
            let name = unique_name("alloc");
            let control = EventDataControl::<RealAtomic>::create(&name, max_slots, 1).expect("create control");
            let mut ts = 0u32;
            for _ in 0..max_slots {
                ts += 1;
                let a = control.allocate().expect("slot available");
                a.publish(ts);
            }

            b.iter(|| {
                ts += 1;
                let a = control.allocate().expect("slot available");
                bb(&a);
                a.publish(ts);
            });

            hdds_shm_events::arena::SlotArena::unlink(&name).ok();
        });
    }

    group.finish();
}

/// `reference_next_event` -> drop (dereference) round trip against a freshly
/// published newest slot, the common subscriber poll pattern.
fn bench_reference_and_dereference(c: &mut Criterion) {
    let mut group = c.benchmark_group("reference_next_event");

    for max_slots in [8u16, 64, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(max_slots), &max_slots, |b, &max_slots| {
            let name = unique_name("ref");
            let control = EventDataControl::<RealAtomic>::create(&name, max_slots, 4).expect("create control");
            let log_index = control.register_subscriber(SubscriberId(1)).expect("register");

            let mut ts = 0u32;
            for _ in 0..max_slots {
                ts += 1;
                let a = control.allocate().expect("slot available");
                a.publish(ts);
            }

            b.iter(|| {
                let sample = control.reference_next(ts - 1, log_index, ts + 1).expect("event available");
                bb(&sample);
            });

            hdds_shm_events::arena::SlotArena::unlink(&name).ok();
        });
    }

    group.finish();
}

/// Lock-step QM+ASIL-B composite allocation, the cost the "QM consumer
/// isolation" policy exists to bound (§4.3.1/§4.5.2).
fn bench_composite_dual_allocate(c: &mut Criterion) {
    use hdds_shm_events::EventDataControlComposite;

    c.bench_function("composite_dual_allocate_next_slot", |b| {
        let qm_name = unique_name("composite_qm");
        let b_name = unique_name("composite_b");
        let qm = EventDataControl::<RealAtomic>::create(&qm_name, 64, 1).expect("create qm");
        let asil_b = EventDataControl::<RealAtomic>::create(&b_name, 64, 1).expect("create asil_b");
        let composite = EventDataControlComposite::new(qm, Some(asil_b));

        let mut ts = 0u32;
        for _ in 0..64 {
            ts += 1;
            let indicator = composite.allocate_next_slot();
            composite.event_ready(&indicator, ts);
        }

        b.iter(|| {
            ts += 1;
            let indicator = composite.allocate_next_slot();
            bb(&indicator);
            composite.event_ready(&indicator, ts);
        });

        hdds_shm_events::arena::SlotArena::unlink(&qm_name).ok();
        hdds_shm_events::arena::SlotArena::unlink(&b_name).ok();
    });
}

criterion_group!(
    benches,
    bench_allocate_steady_state,
    bench_reference_and_dereference,
    bench_composite_dual_allocate
);
criterion_main!(benches);
