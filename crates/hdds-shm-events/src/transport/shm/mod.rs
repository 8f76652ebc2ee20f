// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared-memory segment plumbing.
//!
//! This module owns the one piece of operating-system surface the event slot
//! control plane needs: a named, process-shareable mapping of bytes. Everything
//! above it (control arrays, transaction logs, the composite) is expressed in
//! terms of offsets into a [`ShmSegment`] via [`crate::arena::SlotArena`] and
//! never calls into `libc` directly.

mod segment;

pub use segment::ShmSegment;

use std::fmt;
use std::io;

/// Errors that can occur in shared-memory segment operations.
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory segment creation failed
    SegmentCreate(io::Error),

    /// Shared memory segment open failed
    SegmentOpen(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Data corruption detected (bad magic/version in a control header)
    Corruption,

    /// Invalid segment name
    InvalidName(String),

    /// Segment not found
    NotFound(String),

    /// Invalid slot-array capacity
    InvalidCapacity(usize),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "Shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "Shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
            Self::Corruption => write!(f, "Data corruption detected in control header"),
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "Segment not found: {name}"),
            Self::InvalidCapacity(cap) => {
                write!(f, "Invalid slot-array capacity: {cap} (must be 1..=65535)")
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for shared-memory segment operations.
pub type Result<T> = std::result::Result<T, ShmError>;
