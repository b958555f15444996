#![forbid(unsafe_code)]
//! Error types for RingFS.
//!
//! # Error Taxonomy
//!
//! RingFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `rfs-types` | Byte-level violations while decoding a node header |
//! | Runtime | `RfsError` | `rfs-error` (this crate) | User-facing errors for FUSE, CLI, and API consumers |
//!
//! `rfs-error` does not depend on `rfs-types`. Conversions from `ParseError`
//! happen where both are visible: `rfs-alloc` maps decode failures on a live
//! ring to [`RfsError::Corruption`] and open-time failures to
//! [`RfsError::Format`].
//!
//! ## FUSE errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`RfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `WrongNodeType` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `ReadOnly` | `EROFS` |
//!
//! Checker findings (broken links, bad signatures, ...) are not errors: the
//! checker reports them as its normal output. Only when a live operation
//! trips over a damaged header does the damage surface as `Corruption`.

use thiserror::Error;

/// Unified error type for all RingFS operations.
#[derive(Debug, Error)]
pub enum RfsError {
    /// Mapping, sync, or file I/O failure from the host.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A node header read during a live operation is unusable.
    ///
    /// `offset` is the byte position of the header inside the region.
    #[error("corrupt node at offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// The region does not hold a RingFS image (open-time validation).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Null/empty or otherwise unusable caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An allocator call was handed a node of the wrong type.
    #[error("node at offset {offset} is {actual}, expected {expected}")]
    WrongNodeType {
        offset: u64,
        expected: &'static str,
        actual: String,
    },

    /// No free node is large enough for the request.
    #[error("no space left on device")]
    NoSpace,

    /// Missing filesystem, root, or named node.
    #[error("not found: {0}")]
    NotFound(String),

    /// A node with that name already exists.
    #[error("file exists")]
    Exists,

    /// Name does not fit in the fixed name buffer.
    #[error("name too long")]
    NameTooLong,

    /// Mounted read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl RfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_)
            | Self::InvalidArgument(_)
            | Self::WrongNodeType { .. } => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `RfsError`.
pub type Result<T> = std::result::Result<T, RfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(RfsError, libc::c_int)> = vec![
            (RfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                RfsError::Corruption {
                    offset: 349,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (RfsError::Format("test".into()), libc::EINVAL),
            (RfsError::InvalidArgument("empty".into()), libc::EINVAL),
            (
                RfsError::WrongNodeType {
                    offset: 0,
                    expected: "reserved",
                    actual: "root".into(),
                },
                libc::EINVAL,
            ),
            (RfsError::NoSpace, libc::ENOSPC),
            (RfsError::NotFound("a".into()), libc::ENOENT),
            (RfsError::Exists, libc::EEXIST),
            (RfsError::NameTooLong, libc::ENAMETOOLONG),
            (RfsError::ReadOnly, libc::EROFS),
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
        assert_eq!(RfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = RfsError::Corruption {
            offset: 698,
            detail: "size smaller than a header".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt node at offset 698: size smaller than a header"
        );

        let wrong = RfsError::WrongNodeType {
            offset: 0,
            expected: "reserved",
            actual: "root".into(),
        };
        assert_eq!(wrong.to_string(), "node at offset 0 is root, expected reserved");

        assert_eq!(RfsError::NoSpace.to_string(), "no space left on device");
        assert_eq!(RfsError::NotFound("a".into()).to_string(), "not found: a");
    }
}
