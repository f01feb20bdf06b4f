#![forbid(unsafe_code)]
//! Shared value types for vbd image I/O.
//!
//! Extents, operation kinds, operation flags, pipeline entry tags, and the
//! two shared output sinks (read buffers and compare-and-write mismatch
//! offsets) that cross the submission/execution thread boundary.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Half-open byte range `[off, off + len)` within an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageExtent {
    pub off: u64,
    pub len: u64,
}

impl ImageExtent {
    #[must_use]
    pub fn new(off: u64, len: u64) -> Self {
        Self { off, len }
    }

    /// Exclusive end of the extent, or `None` on u64 overflow.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.off.checked_add(self.len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Kind tag stamped onto every completion and dispatch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoKind {
    Read,
    Write,
    Discard,
    WriteSame,
    CompareAndWrite,
    Flush,
}

impl IoKind {
    /// Stable lowercase label for logs and trace spans.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Discard => "discard",
            Self::WriteSame => "writesame",
            Self::CompareAndWrite => "compare_and_write",
            Self::Flush => "flush",
        }
    }
}

/// Per-operation flag bitmask influencing caching and ordering behavior.
///
/// Opaque to the adaptation layer; forwarded unchanged to the pipeline.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpFlags(u32);

impl OpFlags {
    pub const NONE: Self = Self(0);
    /// Access pattern hint: random.
    pub const FADVISE_RANDOM: Self = Self(1 << 0);
    /// Access pattern hint: sequential.
    pub const FADVISE_SEQUENTIAL: Self = Self(1 << 1);
    /// Drop cached data for the extent after the operation.
    pub const FADVISE_DONTNEED: Self = Self(1 << 2);
    /// Force unit access: data must reach stable media before completion.
    pub const FUA: Self = Self(1 << 3);

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Origin of a flush request.
///
/// The public API always submits `User`; `Internal` is reserved for
/// cache-driven writeback inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlushSource {
    User,
    Internal,
}

/// Ordered pipeline entry tags.
///
/// Every request built by the API layer enters the pipeline at `ApiStart`;
/// later stages exist so internal layers can re-inject requests below
/// themselves.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DispatchLayer {
    ApiStart,
    Cache,
    Core,
}

/// Shared sink the pipeline fills with the bytes of a completed read.
///
/// Cloneable handle over one buffer; the caller keeps one clone and the
/// dispatch request carries another across the execution thread boundary.
#[derive(Debug, Clone, Default)]
pub struct ReadResult {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl ReadResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sink contents with the bytes read. Called by the pipeline.
    pub fn fill(&self, bytes: Vec<u8>) {
        *self.buf.lock() = bytes;
    }

    /// Take the read bytes, leaving the sink empty.
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }
}

/// Shared output slot for the first mismatching byte offset of a failed
/// compare-and-write.
///
/// Written at most once, by the pipeline, only on a comparison mismatch.
/// On a successful compare-and-write the slot is never touched.
#[derive(Debug, Clone, Default)]
pub struct MismatchSlot {
    off: Arc<Mutex<Option<u64>>>,
}

impl MismatchSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the mismatch offset (relative to the start of the compared
    /// range). Called by the pipeline.
    pub fn set(&self, off: u64) {
        *self.off.lock() = Some(off);
    }

    #[must_use]
    pub fn get(&self) -> Option<u64> {
        *self.off.lock()
    }
}
