// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mockable atomic access.
//!
//! [`crate::event_control::EventDataControl`] and
//! [`crate::composite::EventDataControlComposite`] are generic over
//! [`AtomicOps`] rather than calling `AtomicU64` methods directly, so tests
//! can force a specific `compare_exchange` or `fetch_add` outcome without
//! racing a second real thread — the same role the original implementation's
//! `AtomicIndirectorType` template parameter plays, expressed here as a trait
//! generic instantiated twice: [`RealAtomic`] in production,
//! [`mock::MockAtomic`] under test.

use std::sync::atomic::{AtomicU64, Ordering};

/// Narrow interface over the handful of atomic operations the control plane
/// needs, each taking explicit ordering arguments.
pub trait AtomicOps: 'static {
    fn load(cell: &AtomicU64, order: Ordering) -> u64;
    fn store(cell: &AtomicU64, val: u64, order: Ordering);
    fn compare_exchange(
        cell: &AtomicU64,
        current: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64>;
    fn fetch_add(cell: &AtomicU64, val: u64, order: Ordering) -> u64;
    fn fetch_sub(cell: &AtomicU64, val: u64, order: Ordering) -> u64;
}

/// The real, non-mockable implementation used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealAtomic;

impl AtomicOps for RealAtomic {
    #[inline]
    fn load(cell: &AtomicU64, order: Ordering) -> u64 {
        cell.load(order)
    }

    #[inline]
    fn store(cell: &AtomicU64, val: u64, order: Ordering) {
        cell.store(val, order);
    }

    #[inline]
    fn compare_exchange(
        cell: &AtomicU64,
        current: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u64, u64> {
        cell.compare_exchange(current, new, success, failure)
    }

    #[inline]
    fn fetch_add(cell: &AtomicU64, val: u64, order: Ordering) -> u64 {
        cell.fetch_add(val, order)
    }

    #[inline]
    fn fetch_sub(cell: &AtomicU64, val: u64, order: Ordering) -> u64 {
        cell.fetch_sub(val, order)
    }
}
