//! Atomic write sessions: stage in a temp file, rename into place
//!
//! A [`WriteSession`] stages every write in a uniquely named temp file
//! created next to the (symlink-resolved) target, so the final
//! [`commit`](WriteSession::commit) is a rename within one filesystem:
//! readers of the target see either the old content or the new, never a mix.
//! Dropping a session without committing deletes the staged file and leaves
//! the target untouched, which makes early `?` returns and panics safe by
//! default.
//!
//! Sessions optionally hold the path lock for their whole lifetime, giving
//! concurrent cooperating writers a total order.

use std::fs::{self, File, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use crate::backend::LockBackend;
use crate::error::{Error, Result};
use crate::lock::LockGuard;
use crate::mode::OpenMode;

/// Default suffix for staged temp files
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Line-ending translation applied to text-mode writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    /// Leave `\n` untouched
    Lf,
    /// Rewrite every `\n` as `\r\n`
    CrLf,
}

impl LineEnding {
    /// Convention of the running platform.
    pub fn native() -> LineEnding {
        #[cfg(windows)]
        {
            LineEnding::CrLf
        }
        #[cfg(not(windows))]
        {
            LineEnding::Lf
        }
    }

    /// Translated copy of `buf`, or `None` when it can go out as-is.
    fn expand(self, buf: &[u8]) -> Option<Vec<u8>> {
        match self {
            LineEnding::Lf => None,
            LineEnding::CrLf => {
                if !buf.contains(&b'\n') {
                    return None;
                }
                let mut out = Vec::with_capacity(buf.len() + 16);
                for &byte in buf {
                    if byte == b'\n' {
                        out.push(b'\r');
                    }
                    out.push(byte);
                }
                Some(out)
            }
        }
    }
}

/// Builder for [`WriteSession`]
///
/// Defaults: mode `"w"`, locking enabled with no timeout (wait until the
/// lock is free), temp suffix `".tmp"`, no line-ending translation, no fsync
/// before rename, process-selected lock backend.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    mode: String,
    locked: bool,
    lock_timeout: Option<Duration>,
    temp_suffix: String,
    line_ending: Option<LineEnding>,
    durable: bool,
    backend: Option<LockBackend>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            mode: "w".to_string(),
            locked: true,
            lock_timeout: None,
            temp_suffix: TEMP_SUFFIX.to_string(),
            line_ending: None,
            durable: false,
            backend: None,
        }
    }
}

impl SessionOptions {
    pub fn new() -> SessionOptions {
        SessionOptions::default()
    }

    /// Open-mode token (`"w"`, `"a"`, `"r+"`, `"xb"`, ...). The session must
    /// end up writable, so read-only tokens are rejected at open.
    pub fn mode(mut self, mode: &str) -> Self {
        self.mode = mode.to_string();
        self
    }

    /// Hold the exclusive path lock for the whole session (default `true`).
    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    /// Give up on lock acquisition after `timeout` (zero makes a single
    /// attempt). Without this the open blocks until the lock is free.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub(crate) fn lock_timeout_opt(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Suffix for the staged temp file. Uniqueness of the full name is
    /// guaranteed regardless of the suffix.
    pub fn temp_suffix(mut self, suffix: &str) -> Self {
        self.temp_suffix = suffix.to_string();
        self
    }

    /// Translate `\n` on every write. Text modes only; combining this with a
    /// `b` mode fails at open.
    pub fn line_ending(mut self, ending: LineEnding) -> Self {
        self.line_ending = Some(ending);
        self
    }

    /// Flush staged bytes to stable storage before the rename. Off by
    /// default: the rename guarantees atomicity, not durability, and an
    /// unclean shutdown between write and rename may lose (never corrupt)
    /// the update.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Use an explicit lock backend instead of the process-selected one.
    pub fn backend(mut self, backend: LockBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Open a session on `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidMode`] for a bad mode token, a read-only mode, or a
    ///   line-ending option combined with a binary mode
    /// - [`Error::UnsupportedTarget`] when the path (or its symlink target)
    ///   is not a regular file
    /// - [`Error::LockTimeout`] / [`Error::AlreadyLocked`] /
    ///   [`Error::LockFailed`] from lock acquisition
    /// - [`Error::Io`] for everything the filesystem refuses, including
    ///   `AlreadyExists` for `x` modes and `NotFound` for `r+`
    pub fn open(self, path: impl AsRef<Path>) -> Result<WriteSession> {
        WriteSession::open_with(path.as_ref(), self)
    }
}

/// A staged atomic replacement of one file
///
/// Implements [`Write`] (and [`Read`]/[`Seek`] where the mode allows)
/// against the staged temp file. [`commit`](WriteSession::commit) renames
/// the staged file onto the target; dropping without committing discards it.
/// The drop path removes the temp file first and releases the lock second.
#[derive(Debug)]
pub struct WriteSession {
    requested: PathBuf,
    resolved: PathBuf,
    mode: OpenMode,
    line_ending: Option<LineEnding>,
    original_permissions: Option<Permissions>,
    durable: bool,
    temp: Option<NamedTempFile>,
    #[allow(dead_code)]
    lock: Option<LockGuard>,
}

impl WriteSession {
    /// Locked truncating session, the common case (mode `"w"`).
    pub fn create(path: impl AsRef<Path>) -> Result<WriteSession> {
        SessionOptions::new().open(path)
    }

    /// Start from the full set of knobs.
    pub fn options() -> SessionOptions {
        SessionOptions::new()
    }

    fn open_with(path: &Path, options: SessionOptions) -> Result<WriteSession> {
        let mode = OpenMode::parse(&options.mode)?;
        if !mode.write && !mode.append {
            return Err(Error::InvalidMode {
                mode: options.mode.clone(),
                reason: "an atomic write session needs a writable mode".to_string(),
            });
        }
        if options.line_ending.is_some() && mode.binary {
            return Err(Error::InvalidMode {
                mode: options.mode.clone(),
                reason: "line-ending translation only applies to text modes".to_string(),
            });
        }

        let requested = path.to_path_buf();
        let resolved = resolve_target(&requested)?;

        let lock = if options.locked {
            let backend = options.backend.unwrap_or_else(LockBackend::selected);
            Some(
                backend
                    .make_lock(&resolved, options.lock_timeout)
                    .acquire()?,
            )
        } else {
            None
        };

        // Existence-dependent checks run under the lock, and before any
        // temp file is created.
        let target_meta = match fs::metadata(&resolved) {
            Ok(meta) => Some(meta),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(Error::Io {
                    path: resolved.clone(),
                    source: err,
                });
            }
        };
        if mode.exclusive && target_meta.is_some() {
            return Err(Error::Io {
                path: resolved.clone(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "target already exists"),
            });
        }
        if mode.must_exist && target_meta.is_none() {
            return Err(Error::Io {
                path: resolved.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "target does not exist"),
            });
        }

        let mut temp = stage_temp_file(&resolved, &options.temp_suffix)?;
        if mode.seeds_from_target() && target_meta.is_some() {
            seed_from_target(&resolved, &mut temp)?;
            let position = if mode.append {
                SeekFrom::End(0)
            } else {
                SeekFrom::Start(0)
            };
            temp.as_file_mut().seek(position).map_err(|e| Error::Io {
                path: resolved.clone(),
                source: e,
            })?;
        }

        tracing::debug!(
            path = %resolved.display(),
            temp = %temp.path().display(),
            "write session opened"
        );
        Ok(WriteSession {
            requested,
            resolved,
            mode,
            line_ending: options.line_ending,
            original_permissions: target_meta.map(|m| m.permissions()),
            durable: options.durable,
            temp: Some(temp),
            lock,
        })
    }

    /// Path the caller asked to write (possibly a symlink)
    pub fn path(&self) -> &Path {
        &self.requested
    }

    /// Rename destination after one level of symlink resolution
    pub fn resolved_path(&self) -> &Path {
        &self.resolved
    }

    /// Location of the staged temp file while the session is open
    pub fn temp_path(&self) -> Option<&Path> {
        self.temp.as_ref().map(|t| t.path())
    }

    /// Flags parsed from the mode token
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Borrow the staged file directly, e.g. for `set_len`.
    pub fn as_file(&self) -> Option<&File> {
        self.temp.as_ref().map(|t| t.as_file())
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        match self.temp.as_mut() {
            Some(temp) => Ok(temp.as_file_mut()),
            None => Err(io::Error::other("write session already finalized")),
        }
    }

    /// Publish the staged bytes: optionally sync, rename onto the target,
    /// re-apply the original permission bits.
    ///
    /// Consumes the session. A held lock is released after the rename, so
    /// the next writer in line starts from the committed content.
    ///
    /// # Errors
    ///
    /// A failure before or during the rename deletes the staged file and
    /// leaves the target exactly as it was. If the rename succeeds but
    /// re-applying the original permission bits fails, the new content is
    /// already in place and the error reports the permission problem.
    pub fn commit(mut self) -> Result<()> {
        let Some(temp) = self.temp.take() else {
            return Ok(());
        };
        if self.durable {
            temp.as_file().sync_all().map_err(|e| Error::Io {
                path: self.resolved.clone(),
                source: e,
            })?;
        }
        persist_temp(temp, &self.resolved).map_err(|e| Error::Io {
            path: self.resolved.clone(),
            source: e,
        })?;
        if let Some(permissions) = self.original_permissions.take() {
            fs::set_permissions(&self.resolved, permissions).map_err(|e| Error::Io {
                path: self.resolved.clone(),
                source: e,
            })?;
        }
        tracing::debug!(path = %self.resolved.display(), "write session committed");
        Ok(())
    }
}

impl Write for WriteSession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let append = self.mode.append;
        let translated = self.line_ending.and_then(|ending| ending.expand(buf));
        let file = self.file_mut()?;
        if append {
            // Append modes pin every write to the end, wherever the caller
            // has seeked in between.
            file.seek(SeekFrom::End(0))?;
        }
        match translated {
            Some(bytes) => {
                file.write_all(&bytes)?;
                Ok(buf.len())
            }
            None => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl Read for WriteSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.mode.read {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "session not opened for reading",
            ));
        }
        self.file_mut()?.read(buf)
    }
}

impl Seek for WriteSession {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file_mut()?.seek(pos)
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            // Abandoned without commit: the target keeps its bytes.
            let path = temp.path().to_path_buf();
            if let Err(err) = temp.close() {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to remove staged temp file"
                );
            }
        }
        // The lock field drops after this body, releasing only once the
        // staged file is gone.
    }
}

/// Resolve `requested` for writing: dereference a symlink exactly one level
/// and insist the destination is (or can become) a regular file.
fn resolve_target(requested: &Path) -> Result<PathBuf> {
    let meta = match fs::symlink_metadata(requested) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(requested.to_path_buf());
        }
        Err(err) => {
            return Err(Error::Io {
                path: requested.to_path_buf(),
                source: err,
            });
        }
    };
    if meta.file_type().is_symlink() {
        let link = fs::read_link(requested).map_err(|e| Error::Io {
            path: requested.to_path_buf(),
            source: e,
        })?;
        let resolved = if link.is_absolute() {
            link
        } else {
            match requested.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.join(&link),
                _ => link,
            }
        };
        return match fs::metadata(&resolved) {
            Ok(target) if target.is_file() => Ok(resolved),
            Ok(_) => Err(Error::UnsupportedTarget { path: resolved }),
            // Dangling link: a creating mode materializes the link target.
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(resolved),
            Err(err) => Err(Error::Io {
                path: resolved,
                source: err,
            }),
        };
    }
    if meta.is_file() {
        Ok(requested.to_path_buf())
    } else {
        Err(Error::UnsupportedTarget {
            path: requested.to_path_buf(),
        })
    }
}

/// Create the uniquely named staging file next to the resolved target.
fn stage_temp_file(resolved: &Path, suffix: &str) -> Result<NamedTempFile> {
    let dir = match resolved.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let base = resolved
        .file_name()
        .ok_or_else(|| Error::Io {
            path: resolved.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"),
        })?
        .to_string_lossy();
    Builder::new()
        .prefix(&format!("{base}_"))
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(|e| Error::Io {
            path: resolved.to_path_buf(),
            source: e,
        })
}

/// Copy the target's current bytes into the staging file.
///
/// On Linux a copy-on-write clone (`FICLONE`) is attempted first; any
/// refusal (filesystem without reflink support, quota, alien mount) falls
/// back to a plain byte copy.
fn seed_from_target(resolved: &Path, temp: &mut NamedTempFile) -> Result<()> {
    let mut source = File::open(resolved).map_err(|e| Error::Io {
        path: resolved.to_path_buf(),
        source: e,
    })?;

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;

        const FICLONE: libc::c_ulong = 0x4004_9409;
        // SAFETY: both descriptors are open for the duration of the call.
        let rc = unsafe {
            libc::ioctl(
                temp.as_file().as_raw_fd(),
                FICLONE as _,
                source.as_raw_fd(),
            )
        };
        if rc == 0 {
            return Ok(());
        }
    }

    io::copy(&mut source, temp.as_file_mut()).map_err(|e| Error::Io {
        path: resolved.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Rename the staging file onto `dest`.
///
/// Windows cannot always rename over an existing destination; removing it
/// first opens a brief window with no file present, a known platform
/// limitation of the replace step.
fn persist_temp(temp: NamedTempFile, dest: &Path) -> io::Result<()> {
    match temp.persist(dest) {
        Ok(_file) => Ok(()),
        Err(err) => {
            #[cfg(windows)]
            {
                if dest.exists() {
                    fs::remove_file(dest)?;
                    return err.file.persist(dest).map(|_| ()).map_err(|retry| retry.error);
                }
                Err(err.error)
            }
            #[cfg(not(windows))]
            {
                Err(err.error)
            }
        }
    }
}
