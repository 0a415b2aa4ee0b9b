//! Process model.
//!
//! A fixed-width process table, 8 KiB kernel stacks carrying the trap
//! frame and saved context, and the fork/exec/exit/wait lifecycle. ELF
//! parsing and the argv stack layout are plain data transformations and
//! compile for the host test suite; everything touching address spaces
//! and kernel stacks is bare-metal only.

pub mod elf;
pub mod stack;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod creation;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod exit;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod fork;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod pcb;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod table;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod wait;

pub const MAX_PROCS: usize = 64;

/// 8 KiB kernel stack per process.
pub const KSTACK_SIZE: usize = 2 * 4096;
pub const KSTACK_PAGES: usize = KSTACK_SIZE / 4096;

/// Initial user stack pointer; the pages at and below are mapped.
pub const USER_STACK_TOP: u64 = 0x7F_FFFF_F000;
pub const USER_STACK_BASE: u64 = 0x7F_FFFF_E000;

/// The user heap break starts here and grows upward via brk.
pub const USER_HEAP_BASE: u64 = 0x4000_0000;

/// Upper bound the heap may grow to.
pub const USER_HEAP_LIMIT: u64 = 0x4_0000_0000;

/// Width of the per-process open-file table.
pub const MAX_FDS: usize = 32;
