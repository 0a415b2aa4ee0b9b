//! Kernel error types
//!
//! Resource exhaustion and invalid-argument conditions are ordinary
//! `Err` values that propagate up to the caller; user syscalls see -1.
//! Programming invariants (double-acquire, popcli underflow) are panics,
//! never error values.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical page allocator exhausted.
    OutOfMemory,
    /// Process table has no free slot.
    ProcessTableFull,
    /// File descriptor table has no free slot.
    FdTableFull,
    /// No such file descriptor.
    BadFd,
    /// No current process in this context.
    NoProcess,
    /// Executable rejected by the ELF loader.
    BadExecutable,
    /// Pointer argument outside the user address range.
    BadUserPointer,
    /// Device reported an I/O error.
    Io,
    /// Block device registry is full.
    DeviceTableFull,
    /// The operation is not supported by this object.
    Unsupported,
    /// Filesystem-level error with its own code.
    Fs(crate::fs::FsError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::ProcessTableFull => write!(f, "process table full"),
            KernelError::FdTableFull => write!(f, "fd table full"),
            KernelError::BadFd => write!(f, "bad file descriptor"),
            KernelError::NoProcess => write!(f, "no current process"),
            KernelError::BadExecutable => write!(f, "bad executable"),
            KernelError::BadUserPointer => write!(f, "bad user pointer"),
            KernelError::Io => write!(f, "I/O error"),
            KernelError::DeviceTableFull => write!(f, "device table full"),
            KernelError::Unsupported => write!(f, "operation not supported"),
            KernelError::Fs(e) => write!(f, "fs error {}", e.code()),
        }
    }
}

impl From<crate::fs::FsError> for KernelError {
    fn from(e: crate::fs::FsError) -> Self {
        KernelError::Fs(e)
    }
}

impl KernelError {
    /// The negative code surfaced to user space.
    pub fn code(self) -> i64 {
        match self {
            KernelError::Fs(e) => e.code(),
            _ => -1,
        }
    }
}
