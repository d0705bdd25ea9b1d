//! Error types for the lock registry.
//!
//! Mirrors the kinds a caller needs to make a policy decision on: `Locked`
//! and `OutOfMemory` are expected outcomes, not exceptions; the `Io*`
//! variants surface failures while standing up the shared segment;
//! `Internal` means a probe-chain invariant was violated and the shared
//! state can no longer be trusted.
use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RowlockError {
    /// Another owner already holds an incompatible lock.
    #[error("row/table is locked by another owner")]
    Locked,

    /// The lock table has no room for another entry (one slot is always
    /// reserved as a probe terminator).
    #[error("lock table is full")]
    OutOfMemory,

    /// Opening the mapping, the mutex, or resolving the database path failed.
    #[error("cannot open lock registry resource at {path}: {source}")]
    CantOpen { path: PathBuf, source: io::Error },

    /// `lseek` failed while sizing the backing file.
    #[error("seek failed while sizing {path}: {source}")]
    IoSeek { path: PathBuf, source: io::Error },

    /// `write` failed while stretching the backing file to its target size.
    #[error("write failed while sizing {path}: {source}")]
    IoWrite { path: PathBuf, source: io::Error },

    /// `mmap` failed.
    #[error("mmap failed for {path}: {source}")]
    IoShmmap { path: PathBuf, source: io::Error },

    /// A probe-chain invariant was violated. The shared segment this
    /// handle points at can no longer be trusted; callers should treat
    /// this as fatal and stop using the handle.
    #[error("internal invariant violation in lock registry: {0}")]
    Internal(&'static str),
}

pub type Result<T> = std::result::Result<T, RowlockError>;
