// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RAII pointers over a single control slot: a writer-side allocation that
//! discards itself if dropped before publishing, and a reader-side sample
//! that dereferences itself through the transaction log on drop (§4.6.3).
//!
//! Both types are ordinary move-only Rust values — no manual "empty on
//! move" bookkeeping is needed, since the borrow checker already prevents
//! the double-drop that pattern guards against in languages without
//! destructive moves.

use crate::atomic::{AtomicOps, RealAtomic};
use crate::event_control::EventDataControl;
use crate::indicator::{SlotIndex, SlotIndicator};
use crate::transaction_log::TransactionLogIndex;

/// A slot reserved for writing. Dropping it without calling [`Self::publish`]
/// discards the reservation; dropping it after publishing is a no-op, since
/// [`EventDataControl::discard`] only acts on slots still `IN_WRITING`.
pub struct AllocateePtr<'a, A: AtomicOps = RealAtomic> {
    control: &'a EventDataControl<A>,
    indicator: SlotIndicator,
}

impl<'a, A: AtomicOps> AllocateePtr<'a, A> {
    pub(crate) fn new(control: &'a EventDataControl<A>, indicator: SlotIndicator) -> Option<Self> {
        if indicator.is_valid() {
            Some(Self { control, indicator })
        } else {
            None
        }
    }

    #[must_use]
    pub fn index(&self) -> SlotIndex {
        self.indicator.index()
    }

    /// Publish the slot at `timestamp`, consuming the pointer.
    pub fn publish(self, timestamp: u32) {
        self.control.event_ready(&self.indicator, timestamp);
    }

    /// Abandon the reservation without publishing, consuming the pointer.
    /// Equivalent to letting it drop, spelled out for callers that want the
    /// intent visible at the call site.
    pub fn discard(self) {
        self.control.discard(&self.indicator);
    }
}

impl<A: AtomicOps> Drop for AllocateePtr<'_, A> {
    fn drop(&mut self) {
        self.control.discard(&self.indicator);
    }
}

/// The dereference-on-drop half of [`SamplePtr`], split out so the drop glue
/// only needs to remember which transaction log entry to report to.
struct SlotDecrementer<'a, A: AtomicOps> {
    control: &'a EventDataControl<A>,
    log_index: TransactionLogIndex,
}

impl<A: AtomicOps> SlotDecrementer<'_, A> {
    fn dereference(&self, indicator: &SlotIndicator) {
        self.control.dereference_event(indicator, self.log_index);
    }
}

/// A referenced (refcounted) slot held by a subscriber. Dropping it
/// dereferences the slot and records the matching transaction-log commit, so
/// a subscriber that panics mid-use still leaves the log in a state a
/// publisher-restart recovery pass can interpret (§4.4, §4.5.3).
pub struct SamplePtr<'a, A: AtomicOps = RealAtomic> {
    indicator: SlotIndicator,
    decrementer: SlotDecrementer<'a, A>,
}

impl<'a, A: AtomicOps> SamplePtr<'a, A> {
    fn new(indicator: SlotIndicator, decrementer: SlotDecrementer<'a, A>) -> Option<Self> {
        if indicator.is_valid() {
            Some(Self { indicator, decrementer })
        } else {
            None
        }
    }

    #[must_use]
    pub fn index(&self) -> SlotIndex {
        self.indicator.index()
    }
}

impl<A: AtomicOps> Drop for SamplePtr<'_, A> {
    fn drop(&mut self) {
        self.decrementer.dereference(&self.indicator);
    }
}

impl<A: AtomicOps> EventDataControl<A> {
    /// Allocate the next free slot as an RAII [`AllocateePtr`], or `None` if
    /// allocation failed (capacity exhausted or retries ran out — §4.2.2).
    #[must_use]
    pub fn allocate(&self) -> Option<AllocateePtr<'_, A>> {
        AllocateePtr::new(self, self.allocate_next_slot())
    }

    /// Reference the newest qualifying event as an RAII [`SamplePtr`], or
    /// `None` if no slot qualified or retries ran out (§4.2.4).
    #[must_use]
    pub fn reference_next(
        &self,
        last_ts: u32,
        log_index: TransactionLogIndex,
        upper: u32,
    ) -> Option<SamplePtr<'_, A>> {
        let indicator = self.reference_next_event(last_ts, log_index, upper);
        SamplePtr::new(indicator, SlotDecrementer { control: self, log_index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction_log::SubscriberId;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/hdds_shm_events_sampleptr_{tag}_{ts}")
    }

    #[test]
    fn dropping_unpublished_allocatee_discards_slot() {
        let name = unique_name("drop_unpublished");
        let control = EventDataControl::<RealAtomic>::create(&name, 1, 1).unwrap();
        {
            let a = control.allocate().expect("slot available");
            assert_eq!(a.index(), 0);
        }
        assert!(control.get_num_new_events(0) == 0);
        let reallocated = control.allocate_next_slot();
        assert!(reallocated.is_valid());
        crate::arena::SlotArena::unlink(&name).ok();
    }

    #[test]
    fn publishing_allocatee_survives_drop() {
        let name = unique_name("publish_survives");
        let control = EventDataControl::<RealAtomic>::create(&name, 1, 1).unwrap();
        let a = control.allocate().expect("slot available");
        a.publish(5);
        assert_eq!(control.get_num_new_events(0), 1);
        crate::arena::SlotArena::unlink(&name).ok();
    }

    #[test]
    fn dropping_sample_ptr_dereferences_once() {
        let name = unique_name("sample_drop");
        let control = EventDataControl::<RealAtomic>::create(&name, 1, 1).unwrap();
        let log_index = control.register_subscriber(SubscriberId(1)).unwrap();

        let a = control.allocate().expect("slot available");
        a.publish(1);

        {
            let sample = control.reference_next(0, log_index, 2).expect("event available");
            assert_eq!(sample.index(), 0);
        }

        let reallocated = control.allocate_next_slot();
        assert!(reallocated.is_valid(), "refcount must be back to zero after the sample pointer dropped");
        crate::arena::SlotArena::unlink(&name).ok();
    }
}
