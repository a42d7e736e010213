//! Crash-safe, concurrency-safe file replacement
//!
//! This crate writes files so that readers never observe a partial write and
//! concurrent writers never interleave: content is staged in a uniquely
//! named temp file inside the target's own directory, then renamed into
//! place in one atomic step, with the whole cycle optionally serialized by
//! an exclusive advisory lock on a `<path>.lock` side-car.
//!
//! Key pieces:
//!
//! - **One-shot writes**: [`write_atomic`] / [`write_atomic_with`] replace a
//!   file with an in-memory buffer.
//! - **Sessions**: [`SessionOptions`] / [`WriteSession`] expose the staged
//!   file as a [`std::io::Write`] (plus `Read`/`Seek` for update modes) with
//!   commit-or-discard semantics; append and update modes pre-seed the
//!   staging file from the target.
//! - **Locks on their own**: [`make_lock`] / [`PathLock`] / [`LockGuard`],
//!   with a tiered [`LockBackend`] (`fs2` library, OS primitive, or no-op)
//!   probed once per process and injectable per call.
//! - **Mode interpretation**: [`OpenMode`] parses `fopen`-style tokens
//!   (`"r"`, `"w+"`, `"ab"`, `"x"`, ...).
//!
//! Locking is advisory: it serializes cooperating writers but cannot stop an
//! unrelated process from touching the target directly. Renames are atomic
//! only within one filesystem, which is why staging always happens next to
//! the resolved target, behind any symlink.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::io::Write;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Replace a file in one shot, serialized against other writers.
//!     lockwrite::write_atomic("state.json", br#"{"epoch": 42}"#)?;
//!
//!     // Or stage incrementally and publish at the end.
//!     let mut session = lockwrite::SessionOptions::new()
//!         .mode("a")
//!         .lock_timeout(Duration::from_secs(2))
//!         .open("events.log")?;
//!     writeln!(session, "rotated")?;
//!     session.commit()?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod lock;
pub mod logging;
pub mod mode;
pub mod session;
pub mod write;

// Re-export primary API
pub use backend::LockBackend;
pub use error::{Error, Result};
#[cfg(feature = "fs2")]
pub use lock::LockOwner;
pub use lock::{LockGuard, PathLock, make_lock};
pub use mode::OpenMode;
pub use session::{LineEnding, SessionOptions, WriteSession};
pub use write::{WriteOptions, write_atomic, write_atomic_with};
