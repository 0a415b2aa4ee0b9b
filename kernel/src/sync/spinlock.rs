//! Interrupt-safe spinlock with nesting discipline.
//!
//! `lock()` disables interrupts locally, stacking the prior enable flag
//! (first disable records it, matching enable on last release), then
//! busy-waits on an atomic exchange and records the holder. Re-acquiring
//! a held lock or releasing an unheld one is a fatal bug, not an error.
//!
//! A CPU must not hold more than one spinlock and then block on the
//! scheduler; the process-table lock is the one lock that straddles
//! `swtch` and is released by `forkret` on the side that picked up the
//! new process (see the scheduler).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    /// Holder token + 1; 0 when unheld.
    owner: AtomicU64,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: the lock word serializes access to the inner data.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinGuard<'_, T> {
        push_interrupts_off();
        if self.holding() {
            panic!("spinlock: acquire of held lock '{}'", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.owner.store(holder_token(), Ordering::Relaxed);
        SpinGuard { lock: self }
    }

    /// Whether this CPU currently holds the lock.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == holder_token()
    }

    /// Raw pointer to the protected data.
    ///
    /// Used by the frame allocator before `enable_locking()` while boot is
    /// still single-threaded, and by the scheduler across `swtch` where
    /// the guard cannot live on one stack.
    pub fn as_mut_ptr(&self) -> *mut T {
        self.data.get()
    }

    /// Release a lock acquired with [`acquire_raw`](Self::acquire_raw).
    pub fn release_raw(&self) {
        if !self.holding() {
            panic!("spinlock: release of unheld lock '{}'", self.name);
        }
        self.owner.store(0, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_interrupts_off();
    }

    /// Acquire without producing a guard. Pairs with [`release_raw`].
    pub fn acquire_raw(&self) {
        core::mem::forget(self.lock());
    }
}

pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held by this CPU.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_raw();
    }
}

/// A token identifying the acquiring context, compared on re-acquire and
/// release. One per CPU on bare metal, one per thread on the host.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn holder_token() -> u64 {
    crate::arch::x86_64::percpu::cpu_id() as u64 + 1
}

#[cfg(not(target_os = "none"))]
fn holder_token() -> u64 {
    use std::cell::Cell;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: Cell<u64> = const { Cell::new(0) };
    }
    TOKEN.with(|t| {
        if t.get() == 0 {
            t.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        t.get()
    })
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn push_interrupts_off() {
    crate::arch::x86_64::percpu::pushcli();
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn pop_interrupts_off() {
    crate::arch::x86_64::percpu::popcli();
}

// The host has no interrupt flag; keep the nesting bookkeeping so that
// underflow is still caught.
#[cfg(not(target_os = "none"))]
fn push_interrupts_off() {
    HOST_NCLI.with(|n| n.set(n.get() + 1));
}

#[cfg(not(target_os = "none"))]
fn pop_interrupts_off() {
    HOST_NCLI.with(|n| {
        if n.get() == 0 {
            panic!("spinlock: popcli underflow");
        }
        n.set(n.get() - 1);
    });
}

#[cfg(not(target_os = "none"))]
thread_local! {
    static HOST_NCLI: core::cell::Cell<u32> = const { core::cell::Cell::new(0) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_data() {
        let lock = SpinLock::new("test", 41u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn raw_acquire_release() {
        let lock = SpinLock::new("raw", ());
        lock.acquire_raw();
        assert!(lock.holding());
        lock.release_raw();
        assert!(!lock.holding());
    }

    #[test]
    #[should_panic(expected = "acquire of held lock")]
    fn double_acquire_panics() {
        let lock = SpinLock::new("dbl", ());
        lock.acquire_raw();
        lock.acquire_raw();
    }

    #[test]
    fn contended_from_two_threads() {
        use std::sync::Arc;
        let lock = Arc::new(SpinLock::new("cnt", 0u64));
        let mut handles = std::vec::Vec::new();
        for _ in 0..4 {
            let l = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *l.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
