// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounds-checked shared-memory allocator for one event's control state.
//!
//! Grounds the spec's "externally-provided shared-memory allocator"
//! collaborator (§6.1) on [`crate::transport::shm::ShmSegment`] — the same
//! `shm_open`/`mmap` wrapper the rest of this crate family's transport layer
//! already uses. [`SlotArena`] carves one mapped segment into fixed-size
//! regions computed once at construction ([`ArenaLayout`]): the slot status
//! word array, the transaction-log header array, and the transaction-log
//! per-slot state matrix (§6.2). Every region lookup is bounds-checked
//! against the segment's mapped size; an out-of-range lookup terminates the
//! process rather than returning `None` a caller could silently ignore,
//! matching the spec's "terminate on out-of-range" registry policy (§5).

use crate::transport::shm::{Result, ShmError, ShmSegment};
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicU8};

/// Byte layout of one event-data-control's shared state.
///
/// ```text
/// [ control array: max_slots * 8 bytes ]
/// [ log headers:   max_subscribers * 16 bytes ]
/// [ log slot states: max_subscribers * max_slots bytes ]
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ArenaLayout {
    pub max_slots: u16,
    pub max_subscribers: u32,
    pub control_offset: usize,
    pub log_headers_offset: usize,
    pub log_slot_states_offset: usize,
    pub total_size: usize,
}

/// Size in bytes of one transaction-log header record (`subscriber_id`,
/// packed flags, subscribe-state) — see [`crate::transaction_log`].
pub const LOG_HEADER_SIZE: usize = 16;

impl ArenaLayout {
    /// # Panics
    /// Panics if `max_slots` is zero or `max_subscribers` is zero — both are
    /// configuration errors the constructor must reject before ever touching
    /// shared memory.
    #[must_use]
    pub fn compute(max_slots: u16, max_subscribers: u32) -> Self {
        assert!(max_slots > 0, "max_slots must be >= 1");
        assert!(max_subscribers > 0, "max_subscribers must be >= 1");

        let control_offset = 0usize;
        let control_len = max_slots as usize * size_of::<AtomicU64>();

        let log_headers_offset = control_offset + control_len;
        let log_headers_len = max_subscribers as usize * LOG_HEADER_SIZE;

        let log_slot_states_offset = log_headers_offset + log_headers_len;
        let log_slot_states_len = max_subscribers as usize * max_slots as usize;

        let total_size = log_slot_states_offset + log_slot_states_len;

        Self {
            max_slots,
            max_subscribers,
            control_offset,
            log_headers_offset,
            log_slot_states_offset,
            total_size,
        }
    }
}

/// A mapped shared-memory segment, partitioned per [`ArenaLayout`].
pub struct SlotArena {
    segment: ShmSegment,
    layout: ArenaLayout,
    _not_sync_sensitive: PhantomData<()>,
}

impl SlotArena {
    /// Create a brand-new, zero-initialized arena (all slots `INVALID`, no
    /// transaction logs registered — the zero byte pattern already encodes
    /// that for every region).
    pub fn create(name: &str, max_slots: u16, max_subscribers: u32) -> Result<Self> {
        if max_slots == 0 || max_slots as u32 > u16::MAX as u32 {
            return Err(ShmError::InvalidCapacity(max_slots as usize));
        }
        let layout = ArenaLayout::compute(max_slots, max_subscribers);
        let segment = ShmSegment::create(name, layout.total_size)?;
        Ok(Self { segment, layout, _not_sync_sensitive: PhantomData })
    }

    /// Attach to an existing arena created by another process with the same
    /// `max_slots`/`max_subscribers` (and therefore the same layout).
    pub fn open(name: &str, max_slots: u16, max_subscribers: u32) -> Result<Self> {
        let layout = ArenaLayout::compute(max_slots, max_subscribers);
        let segment = ShmSegment::open(name, layout.total_size)?;
        Ok(Self { segment, layout, _not_sync_sensitive: PhantomData })
    }

    pub fn unlink(name: &str) -> Result<()> {
        ShmSegment::unlink(name)
    }

    #[must_use]
    pub fn layout(&self) -> ArenaLayout {
        self.layout
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Pointer to the control slot at `index`.
    ///
    /// # Panics
    /// Terminates the process if `index >= max_slots` — an out-of-range
    /// slot index can only arise from memory corruption or a configuration
    /// mismatch between attaching processes (§5).
    #[must_use]
    pub fn control_slot_ptr(&self, index: u16) -> *const AtomicU64 {
        assert!(
            index < self.layout.max_slots,
            "slot index {index} out of range (max_slots = {})",
            self.layout.max_slots
        );
        let offset = self.layout.control_offset + index as usize * size_of::<AtomicU64>();
        self.typed_ptr::<AtomicU64>(offset)
    }

    /// Pointer to the `LOG_HEADER_SIZE`-byte header for log slot
    /// `log_index`.
    ///
    /// # Panics
    /// Terminates the process if `log_index >= max_subscribers`.
    #[must_use]
    pub fn log_header_ptr(&self, log_index: u32) -> *const u8 {
        assert!(
            log_index < self.layout.max_subscribers,
            "log index {log_index} out of range (max_subscribers = {})",
            self.layout.max_subscribers
        );
        let offset = self.layout.log_headers_offset + log_index as usize * LOG_HEADER_SIZE;
        self.typed_ptr::<u8>(offset)
    }

    /// Pointer to the per-slot transaction state byte for
    /// `(log_index, slot_index)`.
    ///
    /// # Panics
    /// Terminates the process if either index is out of range.
    #[must_use]
    pub fn log_slot_state_ptr(&self, log_index: u32, slot_index: u16) -> *const AtomicU8 {
        assert!(log_index < self.layout.max_subscribers, "log index out of range");
        assert!(slot_index < self.layout.max_slots, "slot index out of range");
        let row = log_index as usize * self.layout.max_slots as usize;
        let offset = self.layout.log_slot_states_offset + row + slot_index as usize;
        self.typed_ptr::<AtomicU8>(offset)
    }

    fn typed_ptr<T>(&self, offset: usize) -> *const T {
        let end = offset.checked_add(size_of::<T>()).expect("arena offset overflow");
        assert!(
            end <= self.segment.size(),
            "arena bounds violation: offset {offset} + {} > segment size {}",
            size_of::<T>(),
            self.segment.size()
        );
        // SAFETY: `offset` was just bounds-checked against the segment's
        // mapped size. `T` is one of `AtomicU64`/`AtomicU8`/`u8`, all valid
        // for any bit pattern, and the segment is zero-initialized on
        // creation so every region starts in a well-defined state. The
        // pointer is valid for as long as `self.segment` (and therefore
        // `self`) is alive.
        unsafe { self.segment.as_ptr().add(offset) as *const T }
    }
}
