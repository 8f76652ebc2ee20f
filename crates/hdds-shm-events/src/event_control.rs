// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event data control: one per event, per criticality section. Owns a
//! bounded control array of slot status words and a transaction log set, and
//! hosts the wait-free-bounded allocate/reference algorithms (§4.2).
//!
//! Generic over [`AtomicOps`] so tests can force specific CAS/`fetch_add`
//! outcomes (§9 "Polymorphism over atomics"); production code always uses the
//! default [`RealAtomic`].

use crate::arena::SlotArena;
use crate::atomic::{AtomicOps, RealAtomic};
use crate::indicator::SlotIndicator;
use crate::slot_status::SlotStatus;
use crate::transaction_log::{SubscriberId, TransactionLogIndex, TransactionLogSet};
use crate::transport::shm::Result;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Retry bound for [`EventDataControl::allocate_next_slot`] (§4.2.2).
pub const MAX_ALLOCATE_RETRIES: usize = 100;

/// Retry bound for [`EventDataControl::reference_next_event`] (§4.2.4).
pub const MAX_REFERENCE_RETRIES: usize = 100;

/// External collaborator for §6.1: a tracing sink that higher layers supply
/// to [`EventDataControl::reference_for_trace`]. This crate defines the
/// trait and the call site only; it implements no sink itself.
pub trait TraceCallback {
    /// Hand the referenced slot off to the sink. The sink may emit the
    /// payload asynchronously (e.g. on a separate trace thread) and must
    /// eventually call `release.release()` exactly once to give the slot
    /// back — holding it past that point starves allocation the same way a
    /// leaked [`crate::sample_ptr::SamplePtr`] would.
    fn submit(&self, slot_index: u16, release: TraceRelease<'_>);
}

/// One-shot handle returned to a [`TraceCallback`] implementation; releasing
/// it dereferences the slot and closes out the same transaction log entry
/// [`EventDataControl::reference_for_trace`] opened.
pub struct TraceRelease<'a> {
    control: &'a dyn ReleaseForTrace,
    slot_index: u16,
    log_index: TransactionLogIndex,
}

impl<'a> TraceRelease<'a> {
    pub fn release(self) {
        self.control.release_trace_reference(self.slot_index, self.log_index);
    }
}

/// Object-safe sliver of [`EventDataControl`] so [`TraceRelease`] does not
/// need to be generic over the atomic indirector.
trait ReleaseForTrace {
    fn release_trace_reference(&self, slot_index: u16, log_index: TransactionLogIndex);
}

/// External collaborator for §4.5.3 step 1: "verify no live publisher
/// exists" via a locking mechanism outside this crate's scope.
pub trait PublisherLivenessCheck {
    fn any_other_publisher_alive(&self) -> bool;
}

/// Process-wide (here: per-control) diagnostic counters (§6.4). Structurally
/// grounded on `transport::shm::metrics::ShmMetrics`: plain `Relaxed`
/// atomics, a `snapshot`/`dump` producing an owned copy, and a `reset`.
/// Never read by the algorithms themselves — purely for test and debugging.
#[derive(Debug, Default)]
pub struct PerformanceCounters {
    pub num_alloc_misses: AtomicU64,
    pub num_alloc_retries: AtomicU64,
    pub num_ref_misses: AtomicU64,
    pub num_ref_retries: AtomicU64,
}

impl PerformanceCounters {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            num_alloc_misses: AtomicU64::new(0),
            num_alloc_retries: AtomicU64::new(0),
            num_ref_misses: AtomicU64::new(0),
            num_ref_retries: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn dump(&self) -> PerformanceCountersSnapshot {
        PerformanceCountersSnapshot {
            num_alloc_misses: self.num_alloc_misses.load(Ordering::Relaxed),
            num_alloc_retries: self.num_alloc_retries.load(Ordering::Relaxed),
            num_ref_misses: self.num_ref_misses.load(Ordering::Relaxed),
            num_ref_retries: self.num_ref_retries.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.num_alloc_misses.store(0, Ordering::Relaxed);
        self.num_alloc_retries.store(0, Ordering::Relaxed);
        self.num_ref_misses.store(0, Ordering::Relaxed);
        self.num_ref_retries.store(0, Ordering::Relaxed);
    }
}

/// Owned snapshot of [`PerformanceCounters`] for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerformanceCountersSnapshot {
    pub num_alloc_misses: u64,
    pub num_alloc_retries: u64,
    pub num_ref_misses: u64,
    pub num_ref_retries: u64,
}

impl std::fmt::Display for PerformanceCountersSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EventDataControl[alloc_misses={}, alloc_retries={}, ref_misses={}, ref_retries={}]",
            self.num_alloc_misses, self.num_alloc_retries, self.num_ref_misses, self.num_ref_retries
        )
    }
}

/// One event's control array and transaction log set (§2, component 4).
pub struct EventDataControl<A: AtomicOps = RealAtomic> {
    arena: SlotArena,
    max_slots: u16,
    max_subscribers: u32,
    counters: PerformanceCounters,
    _atomics: PhantomData<A>,
}

impl<A: AtomicOps> EventDataControl<A> {
    /// Create a brand-new control array in shared memory. All slots start
    /// `INVALID`; no transaction logs are registered (§4.2.1).
    pub fn create(name: &str, max_slots: u16, max_subscribers: u32) -> Result<Self> {
        let arena = SlotArena::create(name, max_slots, max_subscribers)?;
        log::debug!(
            "[SHM-EVENTS] created control array '{}' (max_slots={}, max_subscribers={})",
            name,
            max_slots,
            max_subscribers
        );
        Ok(Self { arena, max_slots, max_subscribers, counters: PerformanceCounters::new(), _atomics: PhantomData })
    }

    /// Attach to an existing control array (e.g. subscriber side, or a
    /// restarted publisher before running [`Self::recover_after_restart`]).
    pub fn open(name: &str, max_slots: u16, max_subscribers: u32) -> Result<Self> {
        let arena = SlotArena::open(name, max_slots, max_subscribers)?;
        log::debug!("[SHM-EVENTS] opened control array '{}'", name);
        Ok(Self { arena, max_slots, max_subscribers, counters: PerformanceCounters::new(), _atomics: PhantomData })
    }

    #[must_use]
    pub fn max_slots(&self) -> u16 {
        self.max_slots
    }

    #[must_use]
    pub fn max_subscribers(&self) -> u32 {
        self.max_subscribers
    }

    #[must_use]
    pub fn counters(&self) -> &PerformanceCounters {
        &self.counters
    }

    #[must_use]
    pub fn dump_performance_counters(&self) -> PerformanceCountersSnapshot {
        self.counters.dump()
    }

    pub fn reset_performance_counters(&self) {
        self.counters.reset();
    }

    fn logs(&self) -> TransactionLogSet<'_> {
        TransactionLogSet::new(&self.arena)
    }

    /// `pub(crate)` so [`crate::composite::EventDataControlComposite`] can
    /// read both sides' status words during its own lock-step candidate scan
    /// (§4.3.1), which picks the smallest ASIL-B timestamp rather than
    /// either side's own oldest-slot ordering.
    pub(crate) fn load_status(&self, index: u16) -> SlotStatus {
        let ptr = self.arena.control_slot_ptr(index);
        // SAFETY: `control_slot_ptr` bounds-checks `index` against `max_slots`.
        SlotStatus::from_raw(A::load(unsafe { &*ptr }, Ordering::Acquire))
    }

    /// §4.2.2: scan for the oldest unused slot. Invalid slots win
    /// immediately (no timestamp to compare); among timestamped candidates
    /// the smallest timestamp wins; ties go to the lower index by virtue of
    /// scan order.
    ///
    /// `pub(crate)` so [`crate::composite::EventDataControlComposite`] can
    /// drive its own lock-step scan over both sides' candidate slots.
    pub(crate) fn find_oldest_unused_slot(&self) -> Option<(u16, SlotStatus)> {
        let mut best: Option<(u16, SlotStatus)> = None;
        for i in 0..self.max_slots {
            let observed = self.load_status(i);
            if !observed.is_free() {
                continue;
            }
            if observed.is_invalid() {
                return Some((i, observed));
            }
            match best {
                None => best = Some((i, observed)),
                Some((_, b)) if observed.timestamp() < b.timestamp() => best = Some((i, observed)),
                _ => {}
            }
        }
        best
    }

    /// §4.2.2. Wait-free bounded: at most [`MAX_ALLOCATE_RETRIES`] attempts.
    pub fn allocate_next_slot(&self) -> SlotIndicator {
        for _ in 0..MAX_ALLOCATE_RETRIES {
            let Some((index, observed)) = self.find_oldest_unused_slot() else {
                continue;
            };
            let slot_ptr = self.arena.control_slot_ptr(index);
            // SAFETY: bounds-checked by `control_slot_ptr`.
            let slot = unsafe { &*slot_ptr };
            match A::compare_exchange(
                slot,
                observed.raw(),
                SlotStatus::IN_WRITING.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return SlotIndicator::new(index, slot_ptr),
                Err(_) => {
                    self.counters.num_alloc_retries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.counters.num_alloc_misses.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "[SHM-EVENTS] allocate_next_slot: exhausted {} retries, no free slot (max_slots={})",
            MAX_ALLOCATE_RETRIES,
            self.max_slots
        );
        SlotIndicator::invalid()
    }

    /// Attempt to lock exactly `index` for writing, expecting it to
    /// currently be free. Used only by the composite's lock-step multi-slot
    /// allocation (§4.3.1), which must keep the QM and ASIL-B sides aligned
    /// on the same index rather than letting each side pick independently.
    ///
    /// Returns `None` if the slot was not free or was raced away by another
    /// allocator — the caller decides whether to retry a different index.
    pub(crate) fn try_lock_slot(&self, index: u16) -> Option<SlotIndicator> {
        let observed = self.load_status(index);
        if !observed.is_free() {
            return None;
        }
        let slot_ptr = self.arena.control_slot_ptr(index);
        // SAFETY: bounds-checked by `control_slot_ptr`.
        let slot = unsafe { &*slot_ptr };
        match A::compare_exchange(
            slot,
            observed.raw(),
            SlotStatus::IN_WRITING.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Some(SlotIndicator::new(index, slot_ptr)),
            Err(_) => None,
        }
    }

    /// Undo a lock acquired via [`Self::try_lock_slot`] by restoring the
    /// slot's pre-lock status with a plain store. Valid only because of the
    /// single-writer contract: nothing else can have touched an `IN_WRITING`
    /// slot concurrently, so a CAS here would be redundant.
    pub(crate) fn unlock_slot(&self, indicator: &SlotIndicator, previous: SlotStatus) {
        A::store(indicator.slot(), previous.raw(), Ordering::Release);
    }

    /// §4.2.3. The publisher is the sole writer by external contract; no CAS
    /// is needed, only a release store.
    ///
    /// # Panics
    /// Terminates the process if `indicator` is invalid or the slot is not
    /// `IN_WRITING`.
    pub fn event_ready(&self, indicator: &SlotIndicator, timestamp: u32) {
        assert!(indicator.is_valid(), "event_ready on an invalid indicator");
        let slot = indicator.slot();
        let observed = SlotStatus::from_raw(A::load(slot, Ordering::Acquire));
        assert!(observed.is_in_writing(), "event_ready requires the slot to be IN_WRITING");
        A::store(slot, SlotStatus::published(timestamp).raw(), Ordering::Release);
    }

    /// §4.2.1/§4.3.3/P7: if the slot is still `IN_WRITING`, invalidate it; a
    /// published slot is left unchanged (readers may already hold it).
    pub fn discard(&self, indicator: &SlotIndicator) {
        if !indicator.is_valid() {
            return;
        }
        let slot = indicator.slot();
        let observed = A::load(slot, Ordering::Acquire);
        if SlotStatus::from_raw(observed).is_in_writing() {
            // Single-writer contract: this CAS is not expected to race.
            let _ = A::compare_exchange(
                slot,
                observed,
                SlotStatus::INVALID.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn find_best_reference_candidate(&self, last_ts: u32, upper: u32) -> Option<(u16, SlotStatus)> {
        let mut best: Option<(u16, SlotStatus)> = None;
        for i in 0..self.max_slots {
            let observed = self.load_status(i);
            if !observed.timestamp_between(last_ts, upper) {
                continue;
            }
            match best {
                None => best = Some((i, observed)),
                Some((_, b)) if observed.timestamp() > b.timestamp() => best = Some((i, observed)),
                _ => {}
            }
        }
        best
    }

    /// §4.2.4. Wait-free bounded: at most [`MAX_REFERENCE_RETRIES`] attempts.
    /// Returns the slot with the maximum timestamp strictly between
    /// `last_ts` and `upper` (P4/P5), or an invalid indicator if none
    /// qualifies or retries are exhausted.
    ///
    /// # Panics
    /// Terminates the process on refcount overflow (§4.5.1) — this indicates
    /// the capacity-planning rule in §4.2.2 was violated.
    pub fn reference_next_event(
        &self,
        last_ts: u32,
        log_index: TransactionLogIndex,
        upper: u32,
    ) -> SlotIndicator {
        for _ in 0..MAX_REFERENCE_RETRIES {
            let Some((index, observed)) = self.find_best_reference_candidate(last_ts, upper) else {
                return SlotIndicator::invalid();
            };
            let incremented = observed
                .incremented()
                .unwrap_or_else(|| panic!("refcount overflow referencing slot {index}"));
            let slot_ptr = self.arena.control_slot_ptr(index);
            // SAFETY: bounds-checked by `control_slot_ptr`.
            let slot = unsafe { &*slot_ptr };

            let logs = self.logs();
            logs.reference_transaction_begin(log_index, index);
            match A::compare_exchange(slot, observed.raw(), incremented.raw(), Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    logs.reference_transaction_commit(log_index, index);
                    return SlotIndicator::new(index, slot_ptr);
                }
                Err(_) => {
                    logs.reference_transaction_abort(log_index, index);
                    self.counters.num_ref_retries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.counters.num_ref_misses.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "[SHM-EVENTS] reference_next_event: exhausted {} retries for bound ({}, {})",
            MAX_REFERENCE_RETRIES,
            last_ts,
            upper
        );
        SlotIndicator::invalid()
    }

    /// §4.2.5: used when the publisher wants to read a slot it just filled
    /// (e.g. for tracing). Precondition: the slot is known readable and no
    /// other party may concurrently invalidate it.
    ///
    /// # Panics
    /// Terminates the process on refcount overflow (§4.5.1).
    pub fn reference_specific_event(&self, slot_index: u16, log_index: TransactionLogIndex) {
        let slot_ptr = self.arena.control_slot_ptr(slot_index);
        // SAFETY: bounds-checked by `control_slot_ptr`.
        let slot = unsafe { &*slot_ptr };

        let logs = self.logs();
        logs.reference_transaction_begin(log_index, slot_index);
        let previous = SlotStatus::from_raw(A::fetch_add(slot, 1, Ordering::AcqRel));
        assert!(
            previous.refcount() < SlotStatus::MAX_REFCOUNT,
            "refcount overflow on reference_specific_event (slot {slot_index})"
        );
        logs.reference_transaction_commit(log_index, slot_index);
    }

    /// §6.1: reference a slot for IPC trace emission and hand the release
    /// back to `sink`. `log_index` is the same kind of transaction-log entry
    /// an ordinary subscriber holds, so a tracer that dies mid-trace rolls
    /// back through the usual recovery path (§4.5.4) like any subscriber.
    pub fn reference_for_trace(&self, slot_index: u16, log_index: TransactionLogIndex, sink: &dyn TraceCallback) {
        self.reference_specific_event(slot_index, log_index);
        sink.submit(slot_index, TraceRelease { control: self, slot_index, log_index });
    }

    /// §4.2.6. The caller must hold a live reference (checked via the
    /// indicator's validity).
    pub fn dereference_event(&self, indicator: &SlotIndicator, log_index: TransactionLogIndex) {
        assert!(indicator.is_valid(), "dereference_event on an invalid indicator");
        let index = indicator.index();
        let logs = self.logs();
        logs.dereference_transaction_begin(log_index, index);
        let _ = A::fetch_sub(indicator.slot(), 1, Ordering::AcqRel);
        logs.dereference_transaction_commit(log_index, index);
    }

    /// §4.2.1: used only by rollback (§4.4.2), never by ordinary subscriber
    /// traffic — it bypasses the transaction log entirely.
    pub fn dereference_event_without_logging(&self, slot_index: u16) {
        let slot_ptr = self.arena.control_slot_ptr(slot_index);
        // SAFETY: bounds-checked by `control_slot_ptr`.
        let slot = unsafe { &*slot_ptr };
        A::fetch_sub(slot, 1, Ordering::AcqRel);
    }
}

impl<A: AtomicOps> ReleaseForTrace for EventDataControl<A> {
    fn release_trace_reference(&self, slot_index: u16, log_index: TransactionLogIndex) {
        let logs = self.logs();
        logs.dereference_transaction_begin(log_index, slot_index);
        self.dereference_event_without_logging(slot_index);
        logs.dereference_transaction_commit(log_index, slot_index);
    }
}

impl<A: AtomicOps> EventDataControl<A> {
    /// Highest timestamp among published (non-invalid, non-writing) slots, if
    /// any. Used by [`crate::composite::EventDataControlComposite`] to
    /// report the composite's latest timestamp without exposing the control
    /// array's internals.
    #[must_use]
    pub fn latest_published_timestamp(&self) -> Option<u32> {
        let mut best: Option<u32> = None;
        for i in 0..self.max_slots {
            let observed = self.load_status(i);
            if observed.is_invalid() || observed.is_in_writing() {
                continue;
            }
            best = Some(best.map_or(observed.timestamp(), |b| b.max(observed.timestamp())));
        }
        best
    }

    /// §4.2.1: read-only scan counting valid, non-writing slots newer than
    /// `ref_ts`.
    #[must_use]
    pub fn get_num_new_events(&self, ref_ts: u32) -> usize {
        let mut count = 0;
        for i in 0..self.max_slots {
            let observed = self.load_status(i);
            if !observed.is_invalid() && !observed.is_in_writing() && observed.timestamp() > ref_ts {
                count += 1;
            }
        }
        count
    }

    /// §4.2.7: recovery helper invoked only after confirming no live
    /// publisher remains. Turns every `IN_WRITING` slot back to `INVALID`.
    ///
    /// # Panics
    /// Terminates the process if a slot's CAS fails — by construction no
    /// other writer can exist at this point (§9 open question: assert and
    /// terminate, since a failure here indicates a bug in the precheck).
    pub fn remove_allocations_for_writing(&self) {
        for i in 0..self.max_slots {
            let slot_ptr = self.arena.control_slot_ptr(i);
            // SAFETY: bounds-checked by `control_slot_ptr`.
            let slot = unsafe { &*slot_ptr };
            let observed = A::load(slot, Ordering::Acquire);
            if SlotStatus::from_raw(observed).is_in_writing() {
                let result = A::compare_exchange(
                    slot,
                    observed,
                    SlotStatus::INVALID.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                assert!(
                    result.is_ok(),
                    "remove_allocations_for_writing: CAS failed on slot {i} — another writer touched it \
                     concurrently, which should be impossible after the no-other-publisher precheck"
                );
            }
        }
    }

    fn rollback_log(&self, index: TransactionLogIndex) {
        let logs = self.logs();
        if logs.needs_rollback(index) {
            log::debug!("[SHM-EVENTS] rolling back transaction log index {}", index.0);
        }
        logs.rollback(index, |slot| self.dereference_event_without_logging(slot));
    }

    /// Register a subscriber (§3.4, §4.5.4). Per TL-4, always runs rollback
    /// on the returned index before handing it back — a no-op scan if the
    /// entry was never touched, a real recovery if it belonged to a
    /// previously crashed subscriber reusing the same identity.
    pub fn register_subscriber(&self, id: SubscriberId) -> Option<TransactionLogIndex> {
        let (index, _needs_rollback) = self.logs().register_subscriber(id)?;
        self.rollback_log(index);
        self.logs().subscribe_commit(index);
        Some(index)
    }

    /// Clean unsubscribe (§3.6): roll back any in-flight transaction (no-op
    /// if none), then free the log entry for reuse.
    pub fn unregister_subscriber(&self, index: TransactionLogIndex) {
        self.logs().unsubscribe_begin(index);
        self.rollback_log(index);
        self.logs().free(index);
    }

    /// §4.5.3: publisher-restart recovery. Verifies no other publisher is
    /// alive, rolls back every transaction log whose subscriber is confirmed
    /// dead, and cleans up abandoned writer-side reservations.
    ///
    /// # Panics
    /// Terminates the process if `liveness` reports another publisher still
    /// alive — running recovery concurrently with a live publisher would
    /// corrupt state.
    pub fn recover_after_restart<L, D>(&self, liveness: &L, subscriber_is_dead: D)
    where
        L: PublisherLivenessCheck,
        D: Fn(SubscriberId) -> bool,
    {
        assert!(
            !liveness.any_other_publisher_alive(),
            "recover_after_restart requires confirming no other publisher is alive"
        );
        let logs = self.logs();
        for i in 0..self.max_subscribers {
            let index = TransactionLogIndex(i);
            if let Some(id) = logs.subscriber_id(index) {
                if logs.needs_rollback(index) && subscriber_is_dead(id) {
                    self.rollback_log(index);
                }
            }
        }
        self.remove_allocations_for_writing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::mock::{self, MockAtomic};

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/hdds_shm_events_ctl_{tag}_{ts}")
    }

    #[test]
    fn allocate_event_ready_and_reference_round_trip() {
        let name = unique_name("r1");
        let control = EventDataControl::<RealAtomic>::create(&name, 5, 2).unwrap();
        let log_index = control.register_subscriber(SubscriberId(1)).unwrap();

        let allocatee = control.allocate_next_slot();
        assert!(allocatee.is_valid());
        control.event_ready(&allocatee, 10);

        let got = control.reference_next_event(9, log_index, 11);
        assert!(got.is_valid());
        assert_eq!(got.index(), allocatee.index());
        assert_eq!(control.load_status(got.index()).refcount(), 1);

        control.dereference_event(&got, log_index);
        assert_eq!(control.load_status(allocatee.index()).refcount(), 0);

        crate::arena::SlotArena::unlink(&name).ok();
    }

    #[test]
    fn allocate_picks_oldest_slot() {
        let name = unique_name("r2");
        let control = EventDataControl::<RealAtomic>::create(&name, 5, 1).unwrap();
        for ts in 1..=5u32 {
            let a = control.allocate_next_slot();
            control.event_ready(&a, ts);
        }
        let next = control.allocate_next_slot();
        assert!(next.is_valid());
        // The slot that held timestamp 1 must be the one reused.
        assert_eq!(next.index(), 0);
        crate::arena::SlotArena::unlink(&name).ok();
    }

    #[test]
    fn discard_before_event_ready_invalidates_slot() {
        let name = unique_name("r3");
        let control = EventDataControl::<RealAtomic>::create(&name, 1, 1).unwrap();
        let a = control.allocate_next_slot();
        control.discard(&a);
        assert!(control.load_status(0).is_invalid());
        crate::arena::SlotArena::unlink(&name).ok();
    }

    #[test]
    fn crash_rollback_frees_stuck_reference() {
        let name = unique_name("r4");
        let control = EventDataControl::<RealAtomic>::create(&name, 1, 1).unwrap();
        let log_index = control.register_subscriber(SubscriberId(42)).unwrap();

        let a = control.allocate_next_slot();
        control.event_ready(&a, 1);
        let got = control.reference_next_event(0, log_index, 2);
        assert!(got.is_valid());
        assert_eq!(control.load_status(0).refcount(), 1);

        // Subscriber process is killed without calling dereference_event;
        // a recovery pass re-registers the same identity and rolls back.
        let _reregistered = control.register_subscriber(SubscriberId(42)).unwrap();
        assert_eq!(control.load_status(0).refcount(), 0);

        let reallocated = control.allocate_next_slot();
        assert!(reallocated.is_valid());
        crate::arena::SlotArena::unlink(&name).ok();
    }

    #[test]
    fn reference_specific_event_overflow_terminates() {
        let name = unique_name("r5");
        let control = EventDataControl::<MockAtomic>::create(&name, 1, 1).unwrap();
        let log_index = control.register_subscriber(SubscriberId(1)).unwrap();
        let a = control.allocate_next_slot();
        control.event_ready(&a, 1);

        mock::clear();
        mock::push_fetch_add_result(SlotStatus::MAX_REFCOUNT as u64);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            control.reference_specific_event(0, log_index);
        }));
        assert!(result.is_err(), "expected termination on refcount overflow");
        mock::clear();
        crate::arena::SlotArena::unlink(&name).ok();
    }

    #[test]
    fn remove_allocations_for_writing_clears_writing_slots() {
        let name = unique_name("r6");
        let control = EventDataControl::<RealAtomic>::create(&name, 2, 1).unwrap();
        let _a = control.allocate_next_slot();
        control.remove_allocations_for_writing();
        assert!(control.load_status(0).is_invalid());
        // Idempotent (R4).
        control.remove_allocations_for_writing();
        crate::arena::SlotArena::unlink(&name).ok();
    }

    struct AlwaysDead;
    impl PublisherLivenessCheck for AlwaysDead {
        fn any_other_publisher_alive(&self) -> bool {
            false
        }
    }

    #[test]
    fn recover_after_restart_rolls_back_dead_subscriber_and_clears_writing_slots() {
        let name = unique_name("r7");
        let control = EventDataControl::<RealAtomic>::create(&name, 2, 2).unwrap();

        let log_index = control.register_subscriber(SubscriberId(9)).unwrap();
        let a = control.allocate_next_slot();
        control.event_ready(&a, 1);
        let got = control.reference_next_event(0, log_index, 2);
        assert!(got.is_valid());
        assert_eq!(control.load_status(0).refcount(), 1);

        // A second publisher reserves a slot and is killed before publishing.
        let _stuck_writer = control.allocate_next_slot();
        assert!(control.load_status(1).is_in_writing());

        // Subscriber 9's process died without calling dereference_event; a
        // fresh publisher restart must confirm no live publisher remains,
        // roll back the dead subscriber's stuck reference, and reclaim the
        // abandoned writer-side reservation.
        control.recover_after_restart(&AlwaysDead, |id| id == SubscriberId(9));

        assert_eq!(control.load_status(0).refcount(), 0);
        assert!(control.load_status(1).is_invalid());

        crate::arena::SlotArena::unlink(&name).ok();
    }

    #[test]
    #[should_panic(expected = "no other publisher is alive")]
    fn recover_after_restart_refuses_while_publisher_alive() {
        struct StillAlive;
        impl PublisherLivenessCheck for StillAlive {
            fn any_other_publisher_alive(&self) -> bool {
                true
            }
        }

        let name = unique_name("r8");
        let control = EventDataControl::<RealAtomic>::create(&name, 1, 1).unwrap();
        control.recover_after_restart(&StillAlive, |_| true);
        crate::arena::SlotArena::unlink(&name).ok();
    }

    #[test]
    fn reference_for_trace_releases_through_the_same_log_entry() {
        struct ImmediateSink;
        impl TraceCallback for ImmediateSink {
            fn submit(&self, _slot_index: u16, release: TraceRelease<'_>) {
                release.release();
            }
        }

        let name = unique_name("r9");
        let control = EventDataControl::<RealAtomic>::create(&name, 2, 1).unwrap();
        let log_index = control.register_subscriber(SubscriberId(1)).unwrap();

        let a = control.allocate_next_slot();
        control.event_ready(&a, 1);

        control.reference_for_trace(a.index(), log_index, &ImmediateSink);
        assert_eq!(control.load_status(a.index()).refcount(), 0);

        crate::arena::SlotArena::unlink(&name).ok();
    }
}
