#![forbid(unsafe_code)]
//! Error types for MossFS.
//!
//! # Error Taxonomy
//!
//! MossFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `moss-types` | Layout violations detected during byte access |
//! | Runtime | `MossError` | `moss-error` (this crate) | Errors surfaced to engine callers |
//!
//! `moss-error` is intentionally independent of `moss-types` to avoid
//! cyclic dependencies; the conversion from `ParseError` to `MossError`
//! happens in the crate that owns the block-number context (`moss-ondisk`
//! callers wrap parse failures as `Corruption { block, detail }`).
//!
//! A few conditions that look like errors deliberately are not:
//!
//! - A search that does not find its key reports `SearchOutcome::Missing`
//!   as a value. `MossError::NotFound` exists only for operations whose
//!   contract requires the key to be present (delete, resize).
//! - Lock-escalation restarts during descent are internal control flow
//!   and never escape an operation.
//!
//! ## errno Mapping
//!
//! Every `MossError` variant maps to exactly one POSIX errno via
//! [`MossError::to_errno`]. The mapping is exhaustive (no wildcard arms)
//! so adding a new variant is a compile error until its errno is
//! assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | `EIO` (or the wrapped raw os error) |
//! | `Corruption` | `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `ReadOnly` | `EROFS` |
//! | `InvalidArgument` | `EINVAL` |

use thiserror::Error;

/// Unified error type for all MossFS tree operations.
#[derive(Debug, Error)]
pub enum MossError {
    /// I/O error reported by the block store (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural corruption detected at a known block.
    ///
    /// Reaching this variant poisons the store: the engine marks the
    /// whole store read-only before the error unwinds, so no caller can
    /// observe a successful result derived from corrupt metadata.
    #[error("corrupt tree block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The block store could not allocate a new tree block.
    #[error("no space left on device")]
    NoSpace,

    /// An operation that requires the key to exist did not find it.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Insert of a key that is already present.
    #[error("key exists")]
    Exists,

    /// The store has been poisoned by an earlier corruption (or mounted
    /// read-only) and a mutation was attempted.
    #[error("read-only store")]
    ReadOnly,

    /// Caller contract violation (item larger than a block can hold,
    /// out-of-order key rewrite, bad split offset).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl MossError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::ReadOnly => libc::EROFS,
            Self::InvalidArgument(_) => libc::EINVAL,
        }
    }

    /// Whether this error must poison the store before unwinding.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `MossError`.
pub type Result<T> = std::result::Result<T, MossError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(MossError, libc::c_int)> = vec![
            (MossError::Io(std::io::Error::other("test")), libc::EIO),
            (
                MossError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (MossError::NoSpace, libc::ENOSPC),
            (MossError::NotFound("(1 0 2)".into()), libc::ENOENT),
            (MossError::Exists, libc::EEXIST),
            (MossError::ReadOnly, libc::EROFS),
            (
                MossError::InvalidArgument("item too large".into()),
                libc::EINVAL,
            ),
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
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = MossError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn only_corruption_is_fatal() {
        assert!(MossError::Corruption {
            block: 7,
            detail: "bad order".into()
        }
        .is_fatal());
        assert!(!MossError::NoSpace.is_fatal());
        assert!(!MossError::ReadOnly.is_fatal());
    }

    #[test]
    fn display_formatting() {
        let err = MossError::Corruption {
            block: 42,
            detail: "keys out of order".into(),
        };
        assert_eq!(err.to_string(), "corrupt tree block 42: keys out of order");
        assert_eq!(MossError::ReadOnly.to_string(), "read-only store");
        assert_eq!(
            MossError::NotFound("(1 0 2)".into()).to_string(),
            "key not found: (1 0 2)"
        );
    }
}
