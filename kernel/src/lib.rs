//! CeruleanOS kernel library
//!
//! Core of a small 64-bit x86 UNIX-like kernel: buddy page allocator,
//! 4-level paging with per-process address spaces, a process table with
//! fork/exec/exit/wait, fast-syscall dispatch, a mountable VFS
//! (initfs / devfs / ext2) and a storage-agnostic block layer.
//!
//! The crate doubles as a host library so that the hardware-independent
//! core (allocator, paging tree, block core, VFS, ELF/argv layout) runs
//! under the standard `cargo test` harness. Everything that touches
//! hardware is gated on `target_os = "none"`.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

// Bare-metal builds use the kernel heap; host builds (unit tests) use the
// system allocator that comes with std.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Get a reference to the global kernel heap allocator.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn kernel_heap() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;
pub mod block;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod logger;
pub mod mm;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod panic;
pub mod process;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod sched;
pub mod sync;
pub mod syscall;
