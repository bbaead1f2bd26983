//! Crate-wide error kinds.
//!
//! Failures split into two classes, the way the teacher's own
//! `Error`-vs-`panic!` split in `printf.rs`/`etrace.rs` does: the ones a
//! caller is expected to recover from (returned as `Err(Error)`) and the
//! ones that indicate a broken invariant, which this crate treats as
//! unrecoverable and reports with [`bug!`] instead of a `Result`.

use std::fmt;

/// User-visible error kinds. Every public fallible operation in this crate
/// returns one of these rather than a richer, per-module error type, so
/// that callers can match on a single enum regardless of which layer
/// (cache, inode, directory, vm) raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Path, directory entry, or open handle not present.
    NotFound,
    /// A directory entry of that name already exists.
    AlreadyExists,
    /// A name was empty, longer than the on-disk field, or contained a
    /// path separator where only a bare name is expected.
    InvalidName,
    /// Operation requires a file but was given a directory.
    IsDir,
    /// Operation requires a directory but was given a file.
    NotDir,
    /// The free-sector (or swap-slot) allocator could not satisfy the
    /// request.
    NoSpace,
    /// A host allocation failed.
    OutOfMemory,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "no such file or directory",
            Error::AlreadyExists => "entry already exists",
            Error::InvalidName => "invalid name",
            Error::IsDir => "is a directory",
            Error::NotDir => "not a directory",
            Error::NoSpace => "no space left on device",
            Error::OutOfMemory => "out of memory",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Panics after logging, for the invariant-violation / corruption class
/// of failure, which aborts the process rather than being returned.
/// Mirrors the teacher's habit (`etrace.rs`) of printing context before
/// handing off to the platform panic handler.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*)
    }};
}
