//! Lock backend selection
//!
//! Three locking tiers are available, probed in priority order:
//!
//! 1. **Library** — advisory locking through the `fs2` crate (default-on
//!    `fs2` cargo feature); richest tier, annotates the lock artifact with
//!    owner metadata.
//! 2. **Native** — the OS primitive: `flock(2)` on Unix, exclusive creation
//!    of the artifact on Windows.
//! 3. **Noop** — no mutual exclusion at all; callers rely solely on the
//!    atomic rename for safety.
//!
//! The probe runs once per process and the result is cached. Callers that
//! need a specific tier (tests, embedders with their own policy) pass a
//! [`LockBackend`] value directly instead of mutating process state; the
//! `LOCKWRITE_BACKEND` environment variable overrides the probe for whole
//! processes that cannot be recompiled.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::lock::PathLock;

/// Environment variable forcing a specific tier (`library`, `native`, `noop`)
const BACKEND_ENV: &str = "LOCKWRITE_BACKEND";

static SELECTED: OnceLock<LockBackend> = OnceLock::new();

/// Locking strategy behind [`PathLock`] acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    /// Always succeeds instantly; no artifact, no cross-process exclusion
    Noop,
    /// `flock(2)` on Unix; exclusive artifact creation on Windows
    Native,
    /// The `fs2` crate, with owner metadata written into the artifact
    #[cfg(feature = "fs2")]
    Library,
}

impl LockBackend {
    /// The backend used when none is injected explicitly.
    ///
    /// Computed once per process: an environment override naming a usable
    /// tier wins, otherwise the best available tier is chosen. Later changes
    /// to the environment have no effect.
    pub fn selected() -> LockBackend {
        *SELECTED.get_or_init(|| {
            let backend = Self::from_env().unwrap_or_else(Self::probe);
            tracing::debug!(backend = %backend, "lock backend selected");
            backend
        })
    }

    /// Create an idle lock for `path` using this backend.
    ///
    /// A `timeout` of `None` blocks until the lock is free; `Some(t)` polls
    /// for at most `t` (zero makes a single attempt).
    pub fn make_lock(self, path: impl AsRef<Path>, timeout: Option<Duration>) -> PathLock {
        PathLock::with_backend(path, timeout, self)
    }

    fn from_env() -> Option<LockBackend> {
        let requested = std::env::var(BACKEND_ENV).ok()?;
        let parsed = Self::from_name(&requested);
        if parsed.is_none() {
            tracing::warn!(
                value = %requested,
                "unusable {BACKEND_ENV} value, falling back to probe"
            );
        }
        parsed
    }

    /// Map an override name to a tier, `None` when unknown or unavailable.
    fn from_name(name: &str) -> Option<LockBackend> {
        match name.to_ascii_lowercase().as_str() {
            "noop" | "none" => Some(LockBackend::Noop),
            "native" => {
                if cfg!(any(unix, windows)) {
                    Some(LockBackend::Native)
                } else {
                    None
                }
            }
            "library" | "fs2" => {
                #[cfg(feature = "fs2")]
                {
                    Some(LockBackend::Library)
                }
                #[cfg(not(feature = "fs2"))]
                {
                    None
                }
            }
            _ => None,
        }
    }

    fn probe() -> LockBackend {
        #[cfg(feature = "fs2")]
        {
            LockBackend::Library
        }
        #[cfg(all(not(feature = "fs2"), any(unix, windows)))]
        {
            LockBackend::Native
        }
        #[cfg(all(not(feature = "fs2"), not(any(unix, windows))))]
        {
            LockBackend::Noop
        }
    }
}

impl fmt::Display for LockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockBackend::Noop => "noop",
            LockBackend::Native => "native",
            #[cfg(feature = "fs2")]
            LockBackend::Library => "library",
        };
        f.write_str(name)
    }
}
