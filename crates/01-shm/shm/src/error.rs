//! Error handling helpers for the shared memory crate.
//!
//! The primitives here keep their error surface small: mapping failures,
//! capacity validation, lock teardown and allocator corruption. The `fusion`
//! crate translates these into its caller-facing taxonomy.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Convenience result alias for fallible shared memory operations.
pub type ShmResult<T, E = ShmError> = Result<T, E>;

#[derive(Debug)]
/// Errors surfaced by low-level shared memory helpers.
pub enum ShmError {
    /// Requested capacity is below the minimum or not properly aligned.
    InvalidCapacity { requested: usize, minimum: usize },
    /// Creating, opening, resizing or mapping a backing file failed.
    Map { path: PathBuf, source: io::Error },
    /// The backing file already exists (exclusive create lost the race).
    Exists(PathBuf),
    /// An offset/length pair falls outside the mapped region.
    OutOfBounds { offset: usize, len: usize, mapped: usize },
    /// The allocator could not satisfy a request without growing.
    OutOfSpace { requested: u64 },
    /// The lock was destroyed while callers still used it.
    Destroyed,
    /// A bounded wait expired.
    TimedOut,
    /// Shared metadata failed a consistency check.
    Corrupt(&'static str),
}

impl ShmError {
    pub(crate) fn map(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ShmError::Map {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidCapacity { requested, minimum } => {
                write!(
                    f,
                    "capacity {requested} must be at least {minimum} bytes and 8-byte aligned"
                )
            }
            ShmError::Map { path, source } => {
                write!(f, "failed to map {}: {source}", path.display())
            }
            ShmError::Exists(path) => write!(f, "{} already exists", path.display()),
            ShmError::OutOfBounds {
                offset,
                len,
                mapped,
            } => {
                write!(
                    f,
                    "range {offset}+{len} exceeds mapped region of {mapped} bytes"
                )
            }
            ShmError::OutOfSpace { requested } => {
                write!(f, "no free block large enough for {requested} bytes")
            }
            ShmError::Destroyed => write!(f, "lock destroyed"),
            ShmError::TimedOut => write!(f, "wait timed out"),
            ShmError::Corrupt(what) => write!(f, "corrupt shared metadata: {what}"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmError::Map { source, .. } => Some(source),
            _ => None,
        }
    }
}
