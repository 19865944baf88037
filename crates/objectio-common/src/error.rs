//! Error types for ObjectIO
//!
//! This module defines the error kinds surfaced by the diskfile layer and
//! the processes built on top of it. Absence (`NotExist`, `Deleted`,
//! `Expired`) is an expected outcome and is kept distinct from corruption
//! (`Quarantined`) and from resource failures (`NoSpace`, `DiskIo`).

use crate::types::Timestamp;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Common result type for ObjectIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ObjectIO
#[derive(Debug, Error)]
pub enum Error {
    // Absence
    #[error("object does not exist")]
    NotExist,

    #[error("object deleted at {timestamp}")]
    Deleted { timestamp: Timestamp },

    #[error("object expired at {delete_at}")]
    Expired { delete_at: Timestamp },

    // Corruption and contract violations
    #[error("object quarantined: {reason}")]
    Quarantined { reason: String },

    #[error("object name collision: requested {requested}, stored {stored}")]
    Collision { requested: String, stored: String },

    // Resources
    #[error("no space left for {required} bytes")]
    NoSpace { required: u64 },

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("timed out after {timeout:?} waiting for replication lock on {path}")]
    ReplicationLockTimeout { path: PathBuf, timeout: Duration },

    #[error("timed out after {timeout:?} waiting for lock on {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("extended attributes not supported on {0}")]
    XattrNotSupported(PathBuf),

    // Input validation
    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid metadata: {0}")]
    Metadata(String),

    #[error("storage policy error: {0}")]
    Policy(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a quarantined error carrying the reason
    pub fn quarantined(reason: impl Into<String>) -> Self {
        Self::Quarantined {
            reason: reason.into(),
        }
    }

    /// Create a storage policy error
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Classify an OS error from an allocation or write.
    ///
    /// `ENOSPC` and `EDQUOT` become [`Error::NoSpace`] so callers can back
    /// off differently than for transient I/O errors.
    #[must_use]
    pub fn from_alloc(err: std::io::Error, required: u64) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOSPC | libc::EDQUOT) => Self::NoSpace { required },
            _ => Self::DiskIo(err),
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReplicationLockTimeout { .. } | Self::LockTimeout { .. }
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotExist | Self::Deleted { .. } | Self::Expired { .. }
        )
    }

    /// Check if the object was moved to quarantine
    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        matches!(self, Self::Quarantined { .. })
    }

    /// Timestamp of the tombstone, if this error reports a delete
    #[must_use]
    pub fn deleted_at(&self) -> Option<Timestamp> {
        match self {
            Self::Deleted { timestamp } => Some(*timestamp),
            _ => None,
        }
    }
}
