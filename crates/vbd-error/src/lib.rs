#![forbid(unsafe_code)]
//! Error types for vbd.
//!
//! `VbdError` is the single user-facing error type returned by the image I/O
//! API and resolved through completions. Every variant maps to exactly one
//! POSIX errno via [`VbdError::to_errno`]; the mapping is exhaustive (no
//! wildcard arm) so adding a new variant is a compile error until its errno
//! is assigned.
//!
//! | Variant | errno | Meaning |
//! |---------|-------|---------|
//! | `Io` | `EIO` | Backing store I/O failure |
//! | `NoDevice` | `ENODEV` | Image has no backing data store |
//! | `InvalidExtent` | `EINVAL` | Extent starts at or beyond image bounds |
//! | `InvalidArgument` | `EINVAL` | Malformed request parameters |
//! | `CompareMismatch` | `EILSEQ` | compare-and-write comparison failed |
//! | `ReadOnly` | `EROFS` | Write against a read-only store |
//! | `ShuttingDown` | `ESHUTDOWN` | Completion discarded before resolution |
//!
//! Completions also carry the signed result convention used on the wire:
//! a non-negative byte count on success, `-errno` on failure (see
//! [`VbdError::to_rc`]).
//!
//! Design constraints:
//! - `vbd-error` MUST NOT depend on `vbd-types` (no cyclic deps).
//! - All string payloads are owned (`String`) so errors can cross thread
//!   boundaries into completions without lifetime entanglement.

use thiserror::Error;

/// Unified error type for all vbd image I/O operations.
#[derive(Debug, Error)]
pub enum VbdError {
    /// Operating system I/O error from a backing store (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image has no usable backing data store attached.
    ///
    /// Raised by the readiness gate before any dispatch request is built.
    #[error("no backing data store")]
    NoDevice,

    /// The requested extent starts at or beyond the end of the image.
    ///
    /// Raised by extent clipping before any completion is created. Extents
    /// that merely overrun the end are clamped, not rejected.
    #[error("invalid extent: off={off} len={len} image_size={size}")]
    InvalidExtent { off: u64, len: u64, size: u64 },

    /// Structurally invalid request parameters (empty write-same pattern,
    /// mismatched compare/write payload lengths, unaligned lengths).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// compare-and-write comparison failed; the write was not applied.
    ///
    /// `off` is the offset of the first differing byte, relative to the
    /// start of the compared range.
    #[error("compare-and-write mismatch at relative offset {off}")]
    CompareMismatch { off: u64 },

    /// Write attempted against a read-only backing store.
    #[error("read-only data store")]
    ReadOnly,

    /// The completion was discarded before the pipeline resolved it.
    #[error("operation abandoned before completion")]
    ShuttingDown,
}

impl VbdError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    ///
    /// Policy notes:
    /// - `CompareMismatch` → `EILSEQ`: matches the SCSI COMPARE AND WRITE
    ///   miscompare convention; callers read the mismatch offset from the
    ///   request's output slot.
    /// - `ShuttingDown` → `ESHUTDOWN`: distinguishes "the pipeline dropped
    ///   this operation" from a media-level `EIO`.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoDevice => libc::ENODEV,
            Self::InvalidExtent { .. } | Self::InvalidArgument(_) => libc::EINVAL,
            Self::CompareMismatch { .. } => libc::EILSEQ,
            Self::ReadOnly => libc::EROFS,
            Self::ShuttingDown => libc::ESHUTDOWN,
        }
    }

    /// Signed result code: `-errno`, for completion/event consumers that use
    /// the "negative error or non-negative byte count" convention.
    #[must_use]
    pub fn to_rc(&self) -> i64 {
        -i64::from(self.to_errno())
    }
}

/// Result alias using `VbdError`.
pub type Result<T> = std::result::Result<T, VbdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(VbdError, libc::c_int)> = vec![
            (VbdError::Io(std::io::Error::other("test")), libc::EIO),
            (VbdError::NoDevice, libc::ENODEV),
            (
                VbdError::InvalidExtent {
                    off: 1000,
                    len: 10,
                    size: 1000,
                },
                libc::EINVAL,
            ),
            (
                VbdError::InvalidArgument("empty pattern".into()),
                libc::EINVAL,
            ),
            (VbdError::CompareMismatch { off: 7 }, libc::EILSEQ),
            (VbdError::ReadOnly, libc::EROFS),
            (VbdError::ShuttingDown, libc::ESHUTDOWN),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::ENOSPC);
        let err = VbdError::Io(raw);
        assert_eq!(err.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn signed_rc_is_negative_errno() {
        assert_eq!(VbdError::NoDevice.to_rc(), -i64::from(libc::ENODEV));
        assert_eq!(
            VbdError::CompareMismatch { off: 0 }.to_rc(),
            -i64::from(libc::EILSEQ)
        );
    }

    #[test]
    fn display_formatting() {
        let err = VbdError::InvalidExtent {
            off: 1000,
            len: 10,
            size: 1000,
        };
        assert_eq!(
            err.to_string(),
            "invalid extent: off=1000 len=10 image_size=1000"
        );

        let mismatch = VbdError::CompareMismatch { off: 42 };
        assert_eq!(
            mismatch.to_string(),
            "compare-and-write mismatch at relative offset 42"
        );

        assert_eq!(VbdError::NoDevice.to_string(), "no backing data store");
    }
}
