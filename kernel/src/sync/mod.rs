//! Synchronization primitives
//!
//! The interrupt-safe [`SpinLock`] is used wherever an interrupt handler
//! participates in the critical section (process table, block requests,
//! pipes, the frame allocator). Data never touched from interrupt context
//! uses plain `spin::Mutex`/`RwLock`.

pub mod spinlock;

pub use spinlock::{SpinGuard, SpinLock};
