// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-subscriber transaction logs and the transaction log set.
//!
//! One log entry exists per (subscriber identity, event) pair, living inside
//! the same shared-memory arena as the control array it protects (§6.2) so a
//! restarted publisher can walk and roll back entries left behind by a dead
//! subscriber (§4.5.3) without any IPC beyond the shared segment itself.
//!
//! This module owns the per-slot state machine (§4.4.1) and registration
//! bookkeeping; it does not know how to mutate a control slot's refcount —
//! [`crate::event_control::EventDataControl`] supplies that as a callback to
//! [`TransactionLogSet::rollback`], keeping this module's knowledge scoped to
//! "what state is this log entry in", not "how do I fix up a slot".

use crate::arena::SlotArena;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Stable index into a [`TransactionLogSet`], returned by
/// [`TransactionLogSet::register_subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLogIndex(pub u32);

/// Opaque, equality-comparable subscriber identity (§3.3). This crate does
/// not prescribe how a higher layer derives it (e.g. PID + generation
/// counter) — it only requires stability across a subscriber's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Per-slot transaction state (§4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotTxState {
    NotInProgress = 0,
    IncrementStart = 1,
    IncrementCommitted = 2,
    DecrementStart = 3,
}

impl SlotTxState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotInProgress,
            1 => Self::IncrementStart,
            2 => Self::IncrementCommitted,
            3 => Self::DecrementStart,
            other => unreachable!("corrupt transaction-log slot state byte {other}"),
        }
    }
}

/// Subscribe/unsubscribe bookkeeping state, orthogonal to the per-slot
/// states above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SubscribeState {
    NotInProgress = 0,
    SubscribeStart = 1,
    SubscribeCommitted = 2,
    UnsubscribeStart = 3,
}

impl SubscribeState {
    fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::NotInProgress,
            1 => Self::SubscribeStart,
            2 => Self::SubscribeCommitted,
            3 => Self::UnsubscribeStart,
            other => unreachable!("corrupt transaction-log subscribe state {other}"),
        }
    }
}

const FLAG_IN_USE: u32 = 1 << 0;
const FLAG_NEEDS_ROLLBACK: u32 = 1 << 1;

/// Raw, fixed-size (16-byte) header for one transaction log entry, placed at
/// `arena.log_header_ptr(index)`. See [`crate::arena::LOG_HEADER_SIZE`].
#[repr(C)]
struct LogHeaderRaw {
    subscriber_id: AtomicU64,
    flags: AtomicU32,
    subscribe_state: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<LogHeaderRaw>() == crate::arena::LOG_HEADER_SIZE);

/// A view over the transaction-log-set region of one event's arena.
///
/// Thin and `Copy`: every method resolves the relevant pointer through the
/// arena's bounds-checked accessors on each call rather than caching raw
/// pointers, since transaction-log bookkeeping is not on the wait-free hot
/// path the way slot-status access is.
#[derive(Clone, Copy)]
pub struct TransactionLogSet<'a> {
    arena: &'a SlotArena,
}

impl<'a> TransactionLogSet<'a> {
    #[must_use]
    pub fn new(arena: &'a SlotArena) -> Self {
        Self { arena }
    }

    fn header(&self, index: u32) -> &LogHeaderRaw {
        let ptr = self.arena.log_header_ptr(index).cast::<LogHeaderRaw>();
        // SAFETY: `log_header_ptr` bounds-checks `index` against
        // `max_subscribers` and returns a pointer to `LOG_HEADER_SIZE` bytes,
        // which the const assertion above ties to `size_of::<LogHeaderRaw>()`.
        unsafe { &*ptr }
    }

    /// Register (or re-register, after a crash) a subscriber.
    ///
    /// Per TL-2, at most one log entry bears a given identity at a time: if
    /// `id` is already registered (§4.5.4, subscriber restart), its existing
    /// index is returned instead of allocating a new one. The returned `bool`
    /// is `needs_rollback`; per TL-4 the caller must run
    /// [`TransactionLogSet::rollback`] before treating the index as usable —
    /// [`crate::event_control::EventDataControl::register_subscriber`] does
    /// this unconditionally, so it is harmless that this method always
    /// leaves a freshly allocated entry with `needs_rollback` set (§3.3: "set
    /// on registration").
    pub fn register_subscriber(&self, id: SubscriberId) -> Option<(TransactionLogIndex, bool)> {
        let max = self.arena.layout().max_subscribers;

        for i in 0..max {
            let h = self.header(i);
            let flags = h.flags.load(Ordering::Acquire);
            if flags & FLAG_IN_USE != 0 && h.subscriber_id.load(Ordering::Acquire) == id.0 {
                return Some((TransactionLogIndex(i), flags & FLAG_NEEDS_ROLLBACK != 0));
            }
        }

        for i in 0..max {
            let h = self.header(i);
            if h.flags.load(Ordering::Acquire) & FLAG_IN_USE == 0 {
                h.subscriber_id.store(id.0, Ordering::Relaxed);
                h.subscribe_state
                    .store(SubscribeState::NotInProgress as u32, Ordering::Relaxed);
                h.flags
                    .store(FLAG_IN_USE | FLAG_NEEDS_ROLLBACK, Ordering::Release);
                return Some((TransactionLogIndex(i), true));
            }
        }

        None
    }

    /// Free a log entry for reuse. Callers must have rolled it back first if
    /// `needs_rollback` was set (clean unsubscribe never sets it).
    pub fn free(&self, index: TransactionLogIndex) {
        let h = self.header(index.0);
        h.flags.store(0, Ordering::Release);
        for slot in 0..self.arena.layout().max_slots {
            self.set_slot_state(index, slot, SlotTxState::NotInProgress);
        }
    }

    #[must_use]
    pub fn needs_rollback(&self, index: TransactionLogIndex) -> bool {
        self.header(index.0).flags.load(Ordering::Acquire) & FLAG_NEEDS_ROLLBACK != 0
    }

    /// The identity registered at `index`, or `None` if the entry is free.
    #[must_use]
    pub fn subscriber_id(&self, index: TransactionLogIndex) -> Option<SubscriberId> {
        let h = self.header(index.0);
        if h.flags.load(Ordering::Acquire) & FLAG_IN_USE == 0 {
            None
        } else {
            Some(SubscriberId(h.subscriber_id.load(Ordering::Acquire)))
        }
    }

    #[must_use]
    pub fn slot_state(&self, index: TransactionLogIndex, slot: u16) -> SlotTxState {
        let ptr = self.arena.log_slot_state_ptr(index.0, slot);
        // SAFETY: bounds-checked by `log_slot_state_ptr` against
        // `max_subscribers`/`max_slots`.
        SlotTxState::from_u8(unsafe { (*ptr).load(Ordering::Acquire) })
    }

    fn set_slot_state(&self, index: TransactionLogIndex, slot: u16, state: SlotTxState) {
        let ptr = self.arena.log_slot_state_ptr(index.0, slot);
        // SAFETY: see `slot_state` above.
        unsafe { (*ptr).store(state as u8, Ordering::Release) };
    }

    /// Begin an increment transaction on `slot`. No second begin may occur
    /// without an intervening commit or abort.
    ///
    /// # Panics
    /// Terminates the process if `slot` already has a transaction in
    /// progress — a contract violation per §7.
    pub fn reference_transaction_begin(&self, index: TransactionLogIndex, slot: u16) {
        let cur = self.slot_state(index, slot);
        assert_eq!(
            cur,
            SlotTxState::NotInProgress,
            "reference_transaction_begin on slot {slot} already has a transaction in progress (state {cur:?})"
        );
        self.set_slot_state(index, slot, SlotTxState::IncrementStart);
    }

    /// # Panics
    /// Terminates the process if `slot` is not in `IncrementStart`.
    pub fn reference_transaction_commit(&self, index: TransactionLogIndex, slot: u16) {
        let cur = self.slot_state(index, slot);
        assert_eq!(cur, SlotTxState::IncrementStart, "commit without matching begin on slot {slot}");
        self.set_slot_state(index, slot, SlotTxState::IncrementCommitted);
    }

    /// # Panics
    /// Terminates the process if `slot` is not in `IncrementStart`.
    pub fn reference_transaction_abort(&self, index: TransactionLogIndex, slot: u16) {
        let cur = self.slot_state(index, slot);
        assert_eq!(cur, SlotTxState::IncrementStart, "abort without matching begin on slot {slot}");
        self.set_slot_state(index, slot, SlotTxState::NotInProgress);
    }

    /// # Panics
    /// Terminates the process if `slot` is not in `IncrementCommitted`.
    pub fn dereference_transaction_begin(&self, index: TransactionLogIndex, slot: u16) {
        let cur = self.slot_state(index, slot);
        assert_eq!(
            cur,
            SlotTxState::IncrementCommitted,
            "dereference_transaction_begin on slot {slot} not holding a committed reference"
        );
        self.set_slot_state(index, slot, SlotTxState::DecrementStart);
    }

    /// # Panics
    /// Terminates the process if `slot` is not in `DecrementStart`.
    pub fn dereference_transaction_commit(&self, index: TransactionLogIndex, slot: u16) {
        let cur = self.slot_state(index, slot);
        assert_eq!(cur, SlotTxState::DecrementStart, "dereference commit without matching begin on slot {slot}");
        self.set_slot_state(index, slot, SlotTxState::NotInProgress);
    }

    #[must_use]
    pub fn subscribe_state(&self, index: TransactionLogIndex) -> SubscribeState {
        SubscribeState::from_u32(self.header(index.0).subscribe_state.load(Ordering::Acquire))
    }

    pub fn subscribe_commit(&self, index: TransactionLogIndex) {
        let h = self.header(index.0);
        h.subscribe_state
            .store(SubscribeState::SubscribeCommitted as u32, Ordering::Release);
    }

    pub fn unsubscribe_begin(&self, index: TransactionLogIndex) {
        let h = self.header(index.0);
        h.subscribe_state
            .store(SubscribeState::UnsubscribeStart as u32, Ordering::Release);
    }

    /// Roll back a log entry (§4.4.2). For every slot in `IncrementCommitted`
    /// or `DecrementStart`, invokes `dereference_without_logging(slot)` to
    /// bring the control slot's refcount back to the logically correct
    /// value, then resets the entry to `NotInProgress`. Entries in
    /// `IncrementStart` never committed, so there is nothing to undo — they
    /// are simply reset. Idempotent (R3): a second call finds every entry
    /// already `NotInProgress` and `needs_rollback` already clear, so it is a
    /// no-op.
    pub fn rollback<F: FnMut(u16)>(&self, index: TransactionLogIndex, mut dereference_without_logging: F) {
        for slot in 0..self.arena.layout().max_slots {
            match self.slot_state(index, slot) {
                SlotTxState::IncrementCommitted | SlotTxState::DecrementStart => {
                    dereference_without_logging(slot);
                    self.set_slot_state(index, slot, SlotTxState::NotInProgress);
                }
                SlotTxState::IncrementStart => {
                    self.set_slot_state(index, slot, SlotTxState::NotInProgress);
                }
                SlotTxState::NotInProgress => {}
            }
        }
        let h = self.header(index.0);
        h.subscribe_state
            .store(SubscribeState::NotInProgress as u32, Ordering::Release);
        h.flags.fetch_and(!FLAG_NEEDS_ROLLBACK, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/hdds_shm_events_txlog_{tag}_{ts}")
    }

    #[test]
    fn register_then_reconnect_same_identity() {
        let name = unique_name("reconnect");
        let arena = SlotArena::create(&name, 4, 2).unwrap();
        let logs = TransactionLogSet::new(&arena);

        let (idx, needs_rb) = logs.register_subscriber(SubscriberId(7)).unwrap();
        assert!(needs_rb);
        logs.rollback(idx, |_| panic!("nothing to roll back yet"));

        let (idx2, needs_rb2) = logs.register_subscriber(SubscriberId(7)).unwrap();
        assert_eq!(idx.0, idx2.0);
        assert!(!needs_rb2, "needs_rollback was already cleared by the first rollback");

        SlotArena::unlink(&name).ok();
    }

    #[test]
    fn full_set_returns_none() {
        let name = unique_name("full");
        let arena = SlotArena::create(&name, 2, 1).unwrap();
        let logs = TransactionLogSet::new(&arena);
        assert!(logs.register_subscriber(SubscriberId(1)).is_some());
        assert!(logs.register_subscriber(SubscriberId(2)).is_none());
        SlotArena::unlink(&name).ok();
    }

    #[test]
    fn rollback_is_idempotent() {
        let name = unique_name("idempotent");
        let arena = SlotArena::create(&name, 2, 1).unwrap();
        let logs = TransactionLogSet::new(&arena);
        let (idx, _) = logs.register_subscriber(SubscriberId(1)).unwrap();

        logs.reference_transaction_begin(idx, 0);
        logs.reference_transaction_commit(idx, 0);

        let mut calls = 0;
        logs.rollback(idx, |_| calls += 1);
        assert_eq!(calls, 1);
        assert_eq!(logs.slot_state(idx, 0), SlotTxState::NotInProgress);

        logs.rollback(idx, |_| calls += 1);
        assert_eq!(calls, 1, "second rollback must not re-dereference");

        SlotArena::unlink(&name).ok();
    }

    #[test]
    #[should_panic(expected = "already has a transaction in progress")]
    fn double_begin_panics() {
        let name = unique_name("doublebegin");
        let arena = SlotArena::create(&name, 1, 1).unwrap();
        let logs = TransactionLogSet::new(&arena);
        let (idx, _) = logs.register_subscriber(SubscriberId(1)).unwrap();
        logs.reference_transaction_begin(idx, 0);
        logs.reference_transaction_begin(idx, 0);
    }
}
