//! One-shot atomic writes
//!
//! [`write_atomic`] replaces a file's content with an in-memory buffer in a
//! single call: lock, stage, rename, unlock. [`write_atomic_with`] exposes
//! the knobs (locking, lock timeout, temp suffix, durability) for callers
//! that need them.

use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use crate::backend::LockBackend;
use crate::error::{Error, Result};
use crate::session::{SessionOptions, TEMP_SUFFIX};

/// Options for [`write_atomic_with`]
///
/// Defaults match [`write_atomic`]: locking on, no lock timeout (wait until
/// free), temp suffix `".tmp"`, no fsync before rename.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    locked: bool,
    lock_timeout: Option<Duration>,
    temp_suffix: String,
    durable: bool,
    backend: Option<LockBackend>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            locked: true,
            lock_timeout: None,
            temp_suffix: TEMP_SUFFIX.to_string(),
            durable: false,
            backend: None,
        }
    }
}

impl WriteOptions {
    pub fn new() -> WriteOptions {
        WriteOptions::default()
    }

    /// Serialize against other cooperating writers (default `true`).
    /// Disable for single-writer paths; the rename stays atomic either way.
    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    /// Give up on lock acquisition after `timeout` instead of waiting
    /// indefinitely.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Suffix for the staged temp file, kept for callers that match on
    /// legacy names. Uniqueness is guaranteed regardless.
    pub fn temp_suffix(mut self, suffix: &str) -> Self {
        self.temp_suffix = suffix.to_string();
        self
    }

    /// Flush staged bytes to stable storage before the rename.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Use an explicit lock backend instead of the process-selected one.
    pub fn backend(mut self, backend: LockBackend) -> Self {
        self.backend = Some(backend);
        self
    }
}

/// Atomically replace `path` with `content`, serialized by the path lock.
///
/// Readers of `path` observe either the previous content or `content` in
/// full, never a mix; concurrent `write_atomic` calls to the same path are
/// totally ordered. On any failure the previous content survives untouched
/// and no temp file is left behind.
///
/// # Errors
///
/// Lock errors and I/O errors propagate as-is; see [`crate::Error`].
pub fn write_atomic(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<()> {
    write_atomic_with(path, content, WriteOptions::new())
}

/// [`write_atomic`] with explicit [`WriteOptions`].
pub fn write_atomic_with(
    path: impl AsRef<Path>,
    content: impl AsRef<[u8]>,
    options: WriteOptions,
) -> Result<()> {
    let path = path.as_ref();
    let mut session_options = SessionOptions::new()
        .mode("w")
        .locked(options.locked)
        .lock_timeout_opt(options.lock_timeout)
        .temp_suffix(&options.temp_suffix)
        .durable(options.durable);
    if let Some(backend) = options.backend {
        session_options = session_options.backend(backend);
    }

    let mut session = session_options.open(path)?;
    session.write_all(content.as_ref()).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    session.commit()
}
