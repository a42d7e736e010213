//! Error types for locking and atomic write operations

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while locking a path or atomically replacing it
#[derive(Error, Debug)]
pub enum Error {
    /// Lock contention outlasted the caller's deadline
    #[error("Timed out waiting for lock on {path} after {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The path is held by another process and no wait was requested
    #[error("{path} is already locked")]
    AlreadyLocked { path: PathBuf },

    /// OS-level locking failure unrelated to contention
    #[error("Failed to lock {path}: {source}")]
    LockFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Open-mode token was not recognized, or conflicts with the options
    #[error("Invalid open mode {mode:?}: {reason}")]
    InvalidMode { mode: String, reason: String },

    /// Target exists but is a directory, socket, or other non-regular file
    #[error("{path} is not a regular file")]
    UnsupportedTarget { path: PathBuf },

    /// File I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
