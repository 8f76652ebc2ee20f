// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mixed-criticality composite: a mandatory QM control paired with an
//! optional ASIL-B control, allocating in lock-step so a single event index
//! carries both criticality sections (§4.3).
//!
//! [`CompositeAllocateePtr`] is the publisher-facing writer-side handle
//! (§4.6.1): it carries a [`CompositeIndicator`] plus a reference back to this
//! composite, not to either side's [`EventDataControl`] alone, so dropping it
//! unpublished discards whichever side(s) the allocation touched.

use crate::atomic::{AtomicOps, RealAtomic};
use crate::event_control::EventDataControl;
use crate::indicator::{CompositeIndicator, CompositeSlotTag};
use crate::slot_status::SlotStatus;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Retry bound for the lock-step QM+ASIL-B allocation loop (§4.3.1) before
/// falling back to ASIL-B-only allocation.
pub const MAX_MULTI_ALLOCATE_RETRY_COUNT: usize = 100;

/// Pairs a mandatory QM [`EventDataControl`] with an optional ASIL-B one.
///
/// When both sides are present, allocation keeps them aligned on the same
/// slot index so a subscriber reading either section can address the other
/// by index alone. If the ASIL-B side is persistently uncooperative (full,
/// or its CAS keeps losing the race), [`Self::ignore_qm_control`] latches
/// permanently and this composite falls back to allocating ASIL-B slots
/// alone — isolating QM consumers from an ASIL-B-only failure instead of
/// starving them.
pub struct EventDataControlComposite<A: AtomicOps = RealAtomic> {
    qm: EventDataControl<A>,
    asil_b: Option<EventDataControl<A>>,
    ignore_qm_control: AtomicBool,
    _atomics: PhantomData<A>,
}

impl<A: AtomicOps> EventDataControlComposite<A> {
    /// # Panics
    /// Terminates the process if both sides are present but their slot
    /// counts differ — lock-step allocation requires identical index
    /// spaces.
    #[must_use]
    pub fn new(qm: EventDataControl<A>, asil_b: Option<EventDataControl<A>>) -> Self {
        if let Some(b) = &asil_b {
            assert_eq!(
                qm.max_slots(),
                b.max_slots(),
                "QM and ASIL-B control arrays must have identical slot counts for lock-step allocation"
            );
        }
        Self { qm, asil_b, ignore_qm_control: AtomicBool::new(false), _atomics: PhantomData }
    }

    #[must_use]
    pub fn qm(&self) -> &EventDataControl<A> {
        &self.qm
    }

    #[must_use]
    pub fn asil_b(&self) -> Option<&EventDataControl<A>> {
        self.asil_b.as_ref()
    }

    #[must_use]
    pub fn is_ignoring_qm_control(&self) -> bool {
        self.ignore_qm_control.load(Ordering::Acquire)
    }

    /// §4.3.1. Three cases: no ASIL-B side at all (delegate to QM), the
    /// latch already tripped (delegate to ASIL-B), or genuine lock-step
    /// allocation bounded by [`MAX_MULTI_ALLOCATE_RETRY_COUNT`].
    pub fn allocate_next_slot(&self) -> CompositeIndicator {
        let Some(asil_b) = self.asil_b.as_ref() else {
            let qm_indicator = self.qm.allocate_next_slot();
            if !qm_indicator.is_valid() {
                return CompositeIndicator::invalid();
            }
            return CompositeIndicator::qm_only(qm_indicator.index(), qm_indicator.slot() as *const AtomicU64);
        };

        if self.ignore_qm_control.load(Ordering::Acquire) {
            return Self::allocate_asil_b_only(asil_b);
        }

        for _ in 0..MAX_MULTI_ALLOCATE_RETRY_COUNT {
            let Some(index) = Self::find_multi_candidate(&self.qm, asil_b) else {
                continue;
            };
            let qm_observed = self.qm.load_status(index);
            let Some(qm_lock) = self.qm.try_lock_slot(index) else {
                continue;
            };
            match asil_b.try_lock_slot(index) {
                Some(b_lock) => {
                    return CompositeIndicator::dual(
                        index,
                        qm_lock.slot() as *const AtomicU64,
                        b_lock.slot() as *const AtomicU64,
                    );
                }
                None => {
                    self.qm.unlock_slot(&qm_lock, qm_observed);
                }
            }
        }

        self.ignore_qm_control.store(true, Ordering::Release);
        log::warn!(
            "[SHM-EVENTS] composite: exhausted {} lock-step allocation retries, latching ignore_qm_control",
            MAX_MULTI_ALLOCATE_RETRY_COUNT
        );
        Self::allocate_asil_b_only(asil_b)
    }

    /// §4.3.1 step 1: scan both arrays in lockstep by index. A candidate is a
    /// pair where the ASIL-B slot is invalid, or neither side is in use.
    /// Among candidates, an invalid ASIL-B slot wins immediately (no
    /// timestamp to compare, same rule as the single-array scan in
    /// [`EventDataControl::find_oldest_unused_slot`]); otherwise the
    /// candidate with the smallest ASIL-B timestamp wins, ties going to the
    /// lower index by scan order.
    fn find_multi_candidate(qm: &EventDataControl<A>, asil_b: &EventDataControl<A>) -> Option<u16> {
        let mut best: Option<(u16, SlotStatus)> = None;
        for i in 0..qm.max_slots() {
            let qm_status = qm.load_status(i);
            let b_status = asil_b.load_status(i);
            let is_candidate = b_status.is_invalid() || (!qm_status.is_used() && !b_status.is_used());
            if !is_candidate {
                continue;
            }
            if b_status.is_invalid() {
                return Some(i);
            }
            match best {
                None => best = Some((i, b_status)),
                Some((_, b)) if b_status.timestamp() < b.timestamp() => best = Some((i, b_status)),
                _ => {}
            }
        }
        best.map(|(i, _)| i)
    }

    fn allocate_asil_b_only(asil_b: &EventDataControl<A>) -> CompositeIndicator {
        let b_indicator = asil_b.allocate_next_slot();
        if !b_indicator.is_valid() {
            return CompositeIndicator::invalid();
        }
        CompositeIndicator::asil_b_only(b_indicator.index(), b_indicator.slot() as *const AtomicU64)
    }

    /// §4.3.2: publish both sections, ASIL-B first, unless QM is being
    /// ignored.
    ///
    /// # Panics
    /// Terminates the process if `indicator` is invalid or either addressed
    /// slot is not `IN_WRITING`.
    pub fn event_ready(&self, indicator: &CompositeIndicator, timestamp: u32) {
        assert!(indicator.is_valid(), "event_ready on an invalid CompositeIndicator");
        match indicator.tag() {
            CompositeSlotTag::QmAndAsilB => {
                self.publish_one(indicator.slot_asil_b(), timestamp);
                if !self.ignore_qm_control.load(Ordering::Acquire) {
                    self.publish_one(indicator.slot_qm(), timestamp);
                }
            }
            CompositeSlotTag::QmOnly => self.publish_one(indicator.slot_qm(), timestamp),
            CompositeSlotTag::AsilBOnly => self.publish_one(indicator.slot_asil_b(), timestamp),
        }
    }

    fn publish_one(&self, slot: &AtomicU64, timestamp: u32) {
        let observed = SlotStatus::from_raw(A::load(slot, Ordering::Acquire));
        assert!(observed.is_in_writing(), "event_ready requires the slot to be IN_WRITING");
        A::store(slot, SlotStatus::published(timestamp).raw(), Ordering::Release);
    }

    /// §4.3.3: discard both sections of a composite allocation that will
    /// never be published.
    pub fn discard(&self, indicator: &CompositeIndicator) {
        if !indicator.is_valid() {
            return;
        }
        match indicator.tag() {
            CompositeSlotTag::QmAndAsilB => {
                self.discard_one(indicator.slot_asil_b());
                self.discard_one(indicator.slot_qm());
            }
            CompositeSlotTag::QmOnly => self.discard_one(indicator.slot_qm()),
            CompositeSlotTag::AsilBOnly => self.discard_one(indicator.slot_asil_b()),
        }
    }

    fn discard_one(&self, slot: &AtomicU64) {
        let observed = A::load(slot, Ordering::Acquire);
        if SlotStatus::from_raw(observed).is_in_writing() {
            let _ = A::compare_exchange(slot, observed, SlotStatus::INVALID.raw(), Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// §4.3.4: the ASIL-B array's latest published timestamp if one is
    /// present, otherwise the QM array's — independent of the
    /// `ignore_qm_control` latch, since that only governs where new
    /// allocations land, not which side is authoritative for "latest". `1`
    /// is the sentinel lower bound when no slot is published yet.
    #[must_use]
    pub fn get_latest_timestamp(&self) -> u32 {
        let side = self.asil_b.as_ref().unwrap_or(&self.qm);
        side.latest_published_timestamp().unwrap_or(1)
    }

    /// Allocate the next free slot across both sections as an RAII
    /// [`CompositeAllocateePtr`], or `None` if allocation failed on every
    /// side (§4.2.2's exhaustion case, propagated through §4.3.1).
    #[must_use]
    pub fn allocate(&self) -> Option<CompositeAllocateePtr<'_, A>> {
        CompositeAllocateePtr::new(self, self.allocate_next_slot())
    }
}

/// Writer-side RAII handle over a [`CompositeIndicator`] (§4.6.1). Carries a
/// reference to the owning composite rather than to a single
/// [`EventDataControl`], so dropping it before [`Self::publish`] discards
/// whichever side(s) the allocation actually touched through
/// [`EventDataControlComposite::discard`] — unlike a bare `CompositeIndicator`
/// returned straight from [`EventDataControlComposite::allocate_next_slot`],
/// which leaks its `IN_WRITING` reservation(s) if the caller drops it without
/// remembering to call `discard` itself.
pub struct CompositeAllocateePtr<'a, A: AtomicOps = RealAtomic> {
    composite: &'a EventDataControlComposite<A>,
    indicator: CompositeIndicator,
}

impl<'a, A: AtomicOps> CompositeAllocateePtr<'a, A> {
    fn new(composite: &'a EventDataControlComposite<A>, indicator: CompositeIndicator) -> Option<Self> {
        if indicator.is_valid() {
            Some(Self { composite, indicator })
        } else {
            None
        }
    }

    #[must_use]
    pub fn index(&self) -> crate::indicator::SlotIndex {
        self.indicator.index()
    }

    #[must_use]
    pub fn tag(&self) -> CompositeSlotTag {
        self.indicator.tag()
    }

    /// Publish the slot(s) at `timestamp`, consuming the pointer.
    pub fn publish(self, timestamp: u32) {
        self.composite.event_ready(&self.indicator, timestamp);
    }

    /// Abandon the reservation without publishing, consuming the pointer.
    /// Equivalent to letting it drop, spelled out for callers that want the
    /// intent visible at the call site.
    pub fn discard(self) {
        self.composite.discard(&self.indicator);
    }
}

impl<A: AtomicOps> Drop for CompositeAllocateePtr<'_, A> {
    fn drop(&mut self) {
        self.composite.discard(&self.indicator);
    }
}
