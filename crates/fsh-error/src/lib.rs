#![forbid(unsafe_code)]
//! Error types for fsshift.
//!
//! Defines `FshError` and a `Result<T>` alias used throughout the
//! workspace, plus the errno and process-exit-code mappings used by the
//! CLI.

use thiserror::Error;

/// Unified error type for all fsshift operations.
#[derive(Debug, Error)]
pub enum FshError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O is not open")]
    NotConnected,

    #[error("I/O is already open")]
    AlreadyConnected,

    #[error("malformed {what}: {detail}")]
    Protocol { what: &'static str, detail: String },

    #[error("arithmetic overflow while {0}")]
    Overflow(&'static str),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("no space left: {0}")]
    NoSpace(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("internal inconsistency: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl FshError {
    /// Convert this error into the closest POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotConnected => libc::ENOTCONN,
            Self::AlreadyConnected => libc::EISCONN,
            Self::Protocol { .. } => libc::EPROTO,
            Self::Overflow(_) => libc::EOVERFLOW,
            Self::OutOfMemory(_) => libc::ENOMEM,
            Self::NoSpace(_) => libc::ENOSPC,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Unsupported(_) => libc::ENOSYS,
            Self::Permission(_) => libc::EACCES,
            Self::Internal(_) => libc::EIO,
            Self::Cancelled => libc::ECANCELED,
        }
    }

    /// Small stable exit code for the CLI, one per error kind.
    #[must_use]
    pub fn to_exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 1,
            Self::NotConnected => 2,
            Self::AlreadyConnected => 3,
            Self::Protocol { .. } => 4,
            Self::Overflow(_) => 5,
            Self::OutOfMemory(_) => 6,
            Self::NoSpace(_) => 7,
            Self::Io(_) => 8,
            Self::Unsupported(_) => 9,
            Self::Permission(_) => 10,
            Self::Internal(_) => 11,
            Self::Cancelled => 12,
        }
    }
}

/// Result alias using `FshError`.
pub type Result<T> = std::result::Result<T, FshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(FshError::NoSpace(String::new()).to_errno(), libc::ENOSPC);
        assert_eq!(FshError::NotConnected.to_errno(), libc::ENOTCONN);
        assert_eq!(
            FshError::Protocol {
                what: "extent file",
                detail: String::new()
            }
            .to_errno(),
            libc::EPROTO
        );
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            FshError::InvalidArgument(String::new()).to_exit_code(),
            FshError::NotConnected.to_exit_code(),
            FshError::AlreadyConnected.to_exit_code(),
            FshError::Overflow("x").to_exit_code(),
            FshError::NoSpace(String::new()).to_exit_code(),
            FshError::Cancelled.to_exit_code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }
}
