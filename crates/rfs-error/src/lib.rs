#![forbid(unsafe_code)]
//! Error types for remapfs.
//!
//! Defines `RemapError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for process exit codes.

use thiserror::Error;

/// Unified error type for all remapfs operations.
#[derive(Debug, Error)]
pub enum RemapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad paths, mismatched devices, inconsistent extent input. Fatal
    /// unless downgraded by `force_run`.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An offset or length does not fit the platform's address arithmetic.
    #[error("arithmetic overflow: {0}")]
    Overflow(String),

    /// The best-fit allocator could not place every relocated extent.
    #[error("no space left to renumber device extents")]
    NoSpace,

    #[error("out of memory: {0}")]
    NoMemory(String),

    /// A resumed job requested a staging size this platform cannot honour.
    #[error("cannot reuse job storage size {requested} bytes: {reason}")]
    StorageSizeMismatch { requested: u64, reason: String },

    #[error("I/O is already open")]
    AlreadyOpen,

    #[error("I/O is not open")]
    NotOpen,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("operation cancelled")]
    Cancelled,

    /// An invariant of the shuffle plan or the storage window was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RemapError {
    /// Convert this error into a POSIX errno suitable as a process exit code.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Config(_) => libc::EINVAL,
            Self::Overflow(_) | Self::StorageSizeMismatch { .. } => libc::EOVERFLOW,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMemory(_) => libc::ENOMEM,
            Self::AlreadyOpen => libc::EISCONN,
            Self::NotOpen => libc::ENOTCONN,
            Self::PermissionDenied => libc::EPERM,
            Self::Cancelled => libc::ECANCELED,
            Self::Internal(_) => libc::EINVAL,
        }
    }
}

impl From<rfs_types::Cancelled> for RemapError {
    fn from(_: rfs_types::Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<rfs_types::NarrowError> for RemapError {
    fn from(err: rfs_types::NarrowError) -> Self {
        Self::Overflow(err.to_string())
    }
}

/// Result alias using `RemapError`.
pub type Result<T> = std::result::Result<T, RemapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_taxonomy() {
        assert_eq!(RemapError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(RemapError::AlreadyOpen.to_errno(), libc::EISCONN);
        assert_eq!(RemapError::NotOpen.to_errno(), libc::ENOTCONN);
        assert_eq!(RemapError::PermissionDenied.to_errno(), libc::EPERM);
        assert_eq!(
            RemapError::Overflow("window".into()).to_errno(),
            libc::EOVERFLOW
        );
        assert_eq!(
            RemapError::Config("bad path".into()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(RemapError::Cancelled.to_errno(), libc::ECANCELED);
    }

    #[test]
    fn io_errors_pass_through_raw_errno() {
        let err = RemapError::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn cancelled_token_converts() {
        let err: RemapError = rfs_types::Cancelled.into();
        assert!(matches!(err, RemapError::Cancelled));
    }
}
