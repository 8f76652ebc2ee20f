// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HDDS Shm Events — zero-copy event slot control plane
//!
//! The lock-free, wait-free control plane underneath a shared-memory
//! publish/subscribe fabric for mixed-criticality automotive middleware.
//! Publishers write samples directly into a shared-memory slot; subscribers
//! read the same slot by reference, never copying the payload. This crate is
//! the part of that fabric that decides *which* slot a publisher may write
//! next, *which* slot a subscriber may read, and how both sides recover when
//! a peer process is killed mid-operation.
//!
//! ## Scope
//!
//! In scope: the control-slot array and its atomic state machine
//! ([`slot_status`]), bounds-checked slot identifiers ([`indicator`]),
//! per-subscriber crash-recovery journals ([`transaction_log`]), the
//! wait-free allocate/reference/dereference algorithms over one criticality
//! section ([`event_control`]), the QM/ASIL-B dual-section composite with its
//! consumer-isolation policy ([`composite`]), the RAII handles that drive the
//! state machine from ordinary Rust ownership ([`sample_ptr`]), and the
//! shared-memory placement of all of the above ([`arena`], [`transport`]).
//!
//! Out of scope (external collaborators, not reimplemented here): service
//! discovery and offer/find-service, configuration file parsing, CLI and
//! signal-handling glue, any concrete [`event_control::TraceCallback`] sink
//! (this crate defines only the trait and the call site,
//! [`event_control::EventDataControl::reference_for_trace`]), multi-process
//! integration harnesses, generated C bindings, and the payload data types
//! themselves. Network transport, multi-host
//! distribution, dynamic topic discovery, QoS negotiation, and type
//! marshalling are non-goals of the fabric this crate belongs to — it is
//! single-host, shared-memory only.
//!
//! ## Reading order
//!
//! The module dependency order mirrors the spec's component list, leaves
//! first: [`slot_status`] -> [`indicator`] -> [`transaction_log`] ->
//! [`event_control`] -> {[`composite`], [`sample_ptr`]}, with [`arena`] and
//! [`transport::shm`] supplying the shared-memory placement both
//! [`event_control`] and [`transaction_log`] build on.
//!
//! ## Concurrency model
//!
//! No mutexes, no condition variables, no OS synchronisation objects — every
//! operation here either completes or retries on a bounded counter
//! (`MAX_ALLOCATE_RETRIES`, `MAX_REFERENCE_RETRIES`,
//! `MAX_MULTI_ALLOCATE_RETRY_COUNT`). The publisher of a given event is
//! assumed single-threaded; multiple concurrent subscribers are always safe.
//! See [`atomic`] for how the algorithms are made testable without racing a
//! second real thread.

pub mod arena;
pub mod atomic;
pub mod composite;
pub mod event_control;
pub mod indicator;
pub mod sample_ptr;
pub mod slot_status;
pub mod transaction_log;
pub mod transport;

pub use atomic::RealAtomic;
pub use composite::{CompositeAllocateePtr, EventDataControlComposite, MAX_MULTI_ALLOCATE_RETRY_COUNT};
pub use event_control::{
    EventDataControl, PerformanceCounters, PerformanceCountersSnapshot, PublisherLivenessCheck, TraceCallback,
    TraceRelease, MAX_ALLOCATE_RETRIES, MAX_REFERENCE_RETRIES,
};
pub use indicator::{CompositeIndicator, CompositeSlotTag, SlotIndex, SlotIndicator};
pub use sample_ptr::{AllocateePtr, SamplePtr};
pub use slot_status::SlotStatus;
pub use transaction_log::{SlotTxState, SubscribeState, SubscriberId, TransactionLogIndex, TransactionLogSet};
pub use transport::shm::{Result, ShmError, ShmSegment};
