//! Exclusive advisory locks keyed on a path
//!
//! A lock on `path` is materialized as a side-car artifact at `path + ".lock"`:
//! acquisition opens the artifact (creating it when absent, never truncating)
//! and takes an exclusive lock on its descriptor. Release unlocks, closes,
//! and removes the artifact again. The artifact's presence alone proves
//! nothing: a crashed holder can leave it behind, and the descriptor lock is
//! what actually excludes other holders, so stale artifacts are silently
//! reacquired.
//!
//! Locks are advisory. They serialize cooperating writers but cannot stop an
//! unrelated process from touching the target directly.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

#[cfg(feature = "fs2")]
use serde::{Deserialize, Serialize};

use crate::backend::LockBackend;
use crate::error::{Error, Result};

/// Sleep between non-blocking acquisition attempts
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Create an idle lock on `path` using the process-selected backend.
///
/// A `timeout` of `None` blocks until the lock is free; `Some(t)` polls for
/// at most `t` before failing with [`Error::LockTimeout`] (zero makes a
/// single attempt). Call [`PathLock::acquire`] to actually take the lock.
pub fn make_lock(path: impl AsRef<Path>, timeout: Option<Duration>) -> PathLock {
    LockBackend::selected().make_lock(path, timeout)
}

/// Side-car artifact path for `target`: the full file name plus `.lock`.
fn lock_artifact_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// An exclusive advisory lock on a path, not yet acquired
///
/// State lives entirely in the returned [`LockGuard`]: a `PathLock` can be
/// acquired again after the previous guard is gone, and cloning it is cheap.
#[derive(Debug, Clone)]
pub struct PathLock {
    target: PathBuf,
    artifact: PathBuf,
    timeout: Option<Duration>,
    backend: LockBackend,
}

impl PathLock {
    /// Create an idle lock bound to an explicit backend.
    pub fn with_backend(
        path: impl AsRef<Path>,
        timeout: Option<Duration>,
        backend: LockBackend,
    ) -> PathLock {
        let target = path.as_ref().to_path_buf();
        let artifact = lock_artifact_path(&target);
        PathLock {
            target,
            artifact,
            timeout,
            backend,
        }
    }

    /// Path this lock guards
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Side-car artifact holding the OS lock (`<target>.lock`)
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Acquire the lock, returning a guard that releases on drop.
    ///
    /// # Errors
    ///
    /// - [`Error::LockTimeout`] when a timeout was set and contention
    ///   outlasted it
    /// - [`Error::AlreadyLocked`] when a blocking acquisition reported
    ///   immediate contention instead of waiting
    /// - [`Error::LockFailed`] for OS locking failures other than contention
    /// - [`Error::Io`] when the artifact itself cannot be opened
    pub fn acquire(&self) -> Result<LockGuard> {
        let held = match self.backend {
            LockBackend::Noop => HeldLock::Noop,
            LockBackend::Native => self.acquire_native()?,
            #[cfg(feature = "fs2")]
            LockBackend::Library => self.acquire_library()?,
        };
        tracing::debug!(
            path = %self.target.display(),
            backend = %self.backend,
            "lock acquired"
        );
        Ok(LockGuard {
            target: self.target.clone(),
            artifact: self.artifact.clone(),
            held: Some(held),
        })
    }

    /// Open the artifact without truncating: a stale artifact left by a
    /// crashed holder is reused as-is.
    fn open_artifact(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.artifact)
            .map_err(|e| Error::Io {
                path: self.artifact.clone(),
                source: e,
            })
    }

    fn timeout_error(&self, waited: Duration) -> Error {
        Error::LockTimeout {
            path: self.target.clone(),
            waited,
        }
    }

    /// Blocking acquisition surfaced an error: contention means someone else
    /// holds the lock and the primitive refused to wait, anything else is a
    /// hard failure.
    fn classify_blocking_failure(&self, err: io::Error) -> Error {
        if is_contention(&err) {
            Error::AlreadyLocked {
                path: self.target.clone(),
            }
        } else {
            Error::LockFailed {
                path: self.target.clone(),
                source: err,
            }
        }
    }

    #[cfg(unix)]
    fn acquire_native(&self) -> Result<HeldLock> {
        let file = self.open_artifact()?;
        let fd = file.as_raw_fd();
        match self.timeout {
            None => loop {
                // SAFETY: fd belongs to `file`, which outlives this call.
                let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
                if rc == 0 {
                    break;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(self.classify_blocking_failure(err));
            },
            Some(timeout) => {
                let start = Instant::now();
                loop {
                    // SAFETY: fd belongs to `file`, which outlives this call.
                    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
                    if rc == 0 {
                        break;
                    }
                    let err = io::Error::last_os_error();
                    if !is_contention(&err) && err.raw_os_error() != Some(libc::EINTR) {
                        return Err(Error::LockFailed {
                            path: self.target.clone(),
                            source: err,
                        });
                    }
                    if start.elapsed() >= timeout {
                        // `file` drops here, closing the descriptor before
                        // the caller sees the error.
                        return Err(self.timeout_error(start.elapsed()));
                    }
                    thread::sleep(RETRY_INTERVAL);
                }
            }
        }
        Ok(HeldLock::Native(file))
    }

    /// Without `flock`, exclusive creation of the artifact is the lock
    /// itself; release deletes it to let the next holder in.
    #[cfg(not(unix))]
    fn acquire_native(&self) -> Result<HeldLock> {
        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.artifact)
            {
                Ok(file) => return Ok(HeldLock::Native(file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => match self.timeout {
                    Some(timeout) if start.elapsed() >= timeout => {
                        return Err(self.timeout_error(start.elapsed()));
                    }
                    _ => thread::sleep(RETRY_INTERVAL),
                },
                Err(err) => {
                    return Err(Error::LockFailed {
                        path: self.target.clone(),
                        source: err,
                    });
                }
            }
        }
    }

    #[cfg(feature = "fs2")]
    fn acquire_library(&self) -> Result<HeldLock> {
        use fs2::FileExt;

        let file = self.open_artifact()?;
        match self.timeout {
            None => loop {
                match file.lock_exclusive() {
                    Ok(()) => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(self.classify_blocking_failure(err)),
                }
            },
            Some(timeout) => {
                let start = Instant::now();
                loop {
                    match file.try_lock_exclusive() {
                        Ok(()) => break,
                        Err(err)
                            if is_contention(&err)
                                || err.kind() == io::ErrorKind::Interrupted =>
                        {
                            if start.elapsed() >= timeout {
                                return Err(self.timeout_error(start.elapsed()));
                            }
                            thread::sleep(RETRY_INTERVAL);
                        }
                        Err(err) => {
                            return Err(Error::LockFailed {
                                path: self.target.clone(),
                                source: err,
                            });
                        }
                    }
                }
            }
        }
        // Annotate the artifact for humans inspecting a contended path.
        // Exclusion never depends on this record.
        if let Err(err) = LockOwner::current().write_to(&file) {
            tracing::debug!(
                path = %self.artifact.display(),
                error = %err,
                "could not record lock owner"
            );
        }
        Ok(HeldLock::Library(file))
    }
}

/// Contention as reported by any tier: `WouldBlock`, the library's contended
/// error, or the raw Unix errno pair.
fn is_contention(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(feature = "fs2")]
    if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
        return true;
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EWOULDBLOCK)
        || err.raw_os_error() == Some(libc::EAGAIN)
    {
        return true;
    }
    false
}

/// Descriptor backing a held lock
#[derive(Debug)]
enum HeldLock {
    /// No exclusion, nothing to clean up
    Noop,
    /// Unix: the flocked artifact descriptor; Windows: the exclusively
    /// created artifact
    Native(File),
    /// The fs2-locked artifact descriptor
    #[cfg(feature = "fs2")]
    Library(File),
}

/// A held exclusive lock
///
/// Dropping the guard releases the lock; [`release`](LockGuard::release)
/// does the same eagerly. Unlock, close, and artifact removal are
/// best-effort and run exactly once across both paths.
#[derive(Debug)]
pub struct LockGuard {
    target: PathBuf,
    artifact: PathBuf,
    held: Option<HeldLock>,
}

impl LockGuard {
    /// Path the lock guards
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Side-car artifact path
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Release now instead of at end of scope.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        let owns_artifact = !matches!(held, HeldLock::Noop);
        match &held {
            HeldLock::Noop => {}
            HeldLock::Native(file) => {
                #[cfg(unix)]
                // SAFETY: the descriptor is still open; LOCK_UN cannot
                // invalidate it. Failure is ignored, closing unlocks anyway.
                unsafe {
                    libc::flock(file.as_raw_fd(), libc::LOCK_UN);
                }
                #[cfg(not(unix))]
                let _ = file;
            }
            #[cfg(feature = "fs2")]
            HeldLock::Library(file) => {
                // Fully qualified: std::fs::File has grown an inherent
                // `unlock` of its own.
                let _ = fs2::FileExt::unlock(file);
            }
        }
        // Close the descriptor before removing the artifact.
        drop(held);
        if owns_artifact {
            if let Err(err) = fs::remove_file(&self.artifact) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %self.artifact.display(),
                        error = %err,
                        "failed to remove lock artifact"
                    );
                }
            }
        }
        tracing::debug!(path = %self.target.display(), "lock released");
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Identity record the library tier leaves in the artifact while held
///
/// Purely informational, for inspecting who is sitting on a contended path.
#[cfg(feature = "fs2")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    /// `user@host` of the holder
    pub owner: String,
    /// Holder process id
    pub pid: u32,
    /// Acquisition time, RFC3339 UTC
    pub acquired_at: String,
}

#[cfg(feature = "fs2")]
impl LockOwner {
    /// Record describing the current process.
    pub fn current() -> LockOwner {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        LockOwner {
            owner: format!("{user}@{host}"),
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Read the record back from an artifact, if present and parseable.
    pub fn read_from(path: &Path) -> Option<LockOwner> {
        let data = fs::read(path).ok()?;
        serde_json::from_slice(&data).ok()
    }

    fn write_to(&self, file: &File) -> io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};

        let payload = serde_json::to_vec_pretty(self)?;
        file.set_len(0)?;
        let mut handle = file;
        handle.seek(SeekFrom::Start(0))?;
        handle.write_all(&payload)?;
        handle.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier, Mutex};
    use tempfile::TempDir;

    /// Best real tier for this build, without consulting the process probe.
    fn test_backend() -> LockBackend {
        #[cfg(feature = "fs2")]
        {
            LockBackend::Library
        }
        #[cfg(not(feature = "fs2"))]
        {
            LockBackend::Native
        }
    }

    fn sandbox() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("data.json");
        (dir, target)
    }

    #[test]
    fn test_artifact_path_appends_suffix() {
        let lock = PathLock::with_backend("/tmp/data.json", None, LockBackend::Noop);
        assert_eq!(lock.artifact(), Path::new("/tmp/data.json.lock"));
        assert_eq!(lock.target(), Path::new("/tmp/data.json"));

        // The full name is kept, not replaced at the last extension.
        let lock = PathLock::with_backend("archive.tar.gz", None, LockBackend::Noop);
        assert_eq!(lock.artifact(), Path::new("archive.tar.gz.lock"));
    }

    #[test]
    fn test_acquire_creates_artifact_and_release_removes_it() {
        let (_dir, target) = sandbox();
        let lock = PathLock::with_backend(&target, None, test_backend());
        let guard = lock.acquire().unwrap();
        assert!(lock.artifact().exists());
        guard.release();
        assert!(!lock.artifact().exists());
        // The target itself was never created.
        assert!(!target.exists());
    }

    #[test]
    fn test_drop_releases() {
        let (_dir, target) = sandbox();
        let lock = PathLock::with_backend(&target, None, test_backend());
        {
            let _guard = lock.acquire().unwrap();
            assert!(lock.artifact().exists());
        }
        assert!(!lock.artifact().exists());
        // And the path is immediately acquirable again.
        let again = lock.acquire().unwrap();
        again.release();
    }

    #[test]
    fn test_zero_timeout_fails_fast_when_held() {
        let (_dir, target) = sandbox();
        let held = PathLock::with_backend(&target, None, test_backend())
            .acquire()
            .unwrap();

        let start = Instant::now();
        let err = PathLock::with_backend(&target, Some(Duration::ZERO), test_backend())
            .acquire()
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }), "got {err:?}");
        assert!(start.elapsed() < Duration::from_millis(500));
        held.release();
    }

    #[test]
    fn test_timeout_bounds_when_held() {
        let (_dir, target) = sandbox();
        let held = PathLock::with_backend(&target, None, test_backend())
            .acquire()
            .unwrap();

        let start = Instant::now();
        let err = PathLock::with_backend(&target, Some(Duration::from_millis(100)), test_backend())
            .acquire()
            .unwrap_err();
        let elapsed = start.elapsed();
        match err {
            Error::LockTimeout { path, waited } => {
                assert_eq!(path, target);
                assert!(waited >= Duration::from_millis(100));
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(50), "gave up too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "gave up too late: {elapsed:?}");
        held.release();
    }

    #[test]
    fn test_waiting_acquirer_gets_lock_after_release() {
        let (_dir, target) = sandbox();
        let target = Arc::new(target);
        let held = PathLock::with_backend(target.as_ref(), None, test_backend())
            .acquire()
            .unwrap();

        let waiter = {
            let target = Arc::clone(&target);
            thread::spawn(move || {
                let guard = PathLock::with_backend(target.as_ref(), None, test_backend())
                    .acquire()
                    .unwrap();
                guard.release();
            })
        };
        thread::sleep(Duration::from_millis(50));
        held.release();
        waiter.join().unwrap();
        assert!(!lock_artifact_path(&target).exists());
    }

    #[test]
    fn test_contending_threads_serialize() {
        let (_dir, target) = sandbox();
        let target = Arc::new(target);
        let barrier = Arc::new(Barrier::new(3));
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let target = Arc::clone(&target);
                let barrier = Arc::clone(&barrier);
                let events = Arc::clone(&events);
                thread::spawn(move || {
                    barrier.wait();
                    let guard = PathLock::with_backend(target.as_ref(), None, test_backend())
                        .acquire()
                        .unwrap();
                    events.lock().unwrap().push(format!("acquired_{i}"));
                    thread::sleep(Duration::from_millis(30));
                    events.lock().unwrap().push(format!("releasing_{i}"));
                    guard.release();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Holders never interleave: every acquire is chased by its own
        // release before the next acquire shows up.
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 6);
        for pair in events.chunks(2) {
            let id = pair[0].strip_prefix("acquired_").expect("acquire first");
            assert_eq!(pair[1], format!("releasing_{id}"));
        }
    }

    #[test]
    fn test_orphaned_artifact_is_reacquired() {
        let (_dir, target) = sandbox();
        let lock = PathLock::with_backend(&target, Some(Duration::ZERO), test_backend());
        fs::write(lock.artifact(), b"left by a crashed process").unwrap();

        let guard = lock.acquire().unwrap();
        guard.release();
        assert!(!lock.artifact().exists());
    }

    #[test]
    fn test_noop_backend_never_touches_disk() {
        let (_dir, target) = sandbox();
        let lock = PathLock::with_backend(&target, None, LockBackend::Noop);
        let first = lock.acquire().unwrap();
        // No exclusion either: a second acquire succeeds while held.
        let second = lock.acquire().unwrap();
        assert!(!lock.artifact().exists());
        first.release();
        second.release();
        assert!(!lock.artifact().exists());
    }

    #[cfg(feature = "fs2")]
    #[test]
    fn test_library_tier_records_owner() {
        let (_dir, target) = sandbox();
        let lock = PathLock::with_backend(&target, None, LockBackend::Library);
        let guard = lock.acquire().unwrap();

        let owner = LockOwner::read_from(guard.artifact()).expect("owner record");
        assert_eq!(owner.pid, std::process::id());
        assert!(owner.owner.contains('@'));
        assert!(owner.acquired_at.contains('T'));
        guard.release();
    }

    #[test]
    fn test_make_lock_uses_selected_backend() {
        let (_dir, target) = sandbox();
        let lock = make_lock(&target, Some(Duration::from_millis(10)));
        let guard = lock.acquire().unwrap();
        guard.release();
    }
}
