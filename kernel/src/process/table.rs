//! The process table.
//!
//! A fixed array of slots guarded by one spinlock. The lock covers
//! state transitions and the scheduler's scan; it is the single lock
//! allowed to straddle `swtch`, and `forkret` releases it on the side
//! that picked up a freshly created process.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use super::pcb::{ProcState, Process};
use super::{KSTACK_PAGES, KSTACK_SIZE, MAX_PROCS};
use crate::arch::x86_64::percpu;
use crate::mm::FRAME_ALLOCATOR;
use crate::sync::SpinLock;

pub struct ProcTable {
    pub lock: SpinLock<()>,
    slots: [UnsafeCell<Process>; MAX_PROCS],
    next_pid: AtomicU32,
}

// SAFETY: slot access follows the table-lock discipline documented on
// `slot`; only one CPU schedules.
unsafe impl Sync for ProcTable {}

pub static TABLE: ProcTable = ProcTable {
    lock: SpinLock::new("proc", ()),
    slots: [const { UnsafeCell::new(Process::empty()) }; MAX_PROCS],
    next_pid: AtomicU32::new(1),
};

impl ProcTable {
    /// Borrow slot `index`.
    ///
    /// # Safety
    /// The caller must either hold the table lock or be the unique
    /// accessor of that slot (the owning process touching its own
    /// non-state fields).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot(&self, index: usize) -> &mut Process {
        // SAFETY: per the function contract.
        unsafe { &mut *self.slots[index].get() }
    }

    /// Claim an unused slot: assigns a pid, moves it to `Embryo` and
    /// gives it a fresh kernel stack.
    pub fn alloc(&self) -> Option<&'static mut Process> {
        self.lock.acquire_raw();
        for index in 0..MAX_PROCS {
            // SAFETY: table lock held.
            let p = unsafe { TABLE.slot(index) };
            if p.state != ProcState::Unused {
                continue;
            }
            p.pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
            p.state = ProcState::Embryo;
            self.lock.release_raw();

            let Some(kstack) = FRAME_ALLOCATOR.alloc_pages(KSTACK_PAGES) else {
                p.state = ProcState::Unused;
                return None;
            };
            // SAFETY: fresh stack, exclusively owned by this slot.
            unsafe { core::ptr::write_bytes(kstack.as_ptr(), 0, KSTACK_SIZE) };
            p.kstack = kstack.as_ptr();
            return Some(p);
        }
        self.lock.release_raw();
        None
    }

    /// Return an embryo slot to the free pool after a failed creation.
    pub fn discard(&self, p: &mut Process) {
        if let Some(kstack) = core::ptr::NonNull::new(p.kstack) {
            FRAME_ALLOCATOR.free_pages(kstack, KSTACK_PAGES);
        }
        p.kstack = core::ptr::null_mut();
        p.space = None;
        p.close_fds();
        self.lock.acquire_raw();
        p.state = ProcState::Unused;
        self.lock.release_raw();
    }
}

/// The process running on this CPU, if any.
pub fn current() -> Option<&'static mut Process> {
    let ptr = percpu::mycpu().current;
    if ptr.is_null() {
        None
    } else {
        // SAFETY: the scheduler set this pointer to a live table slot
        // and will not reuse the slot while the process is current.
        Some(unsafe { &mut *ptr })
    }
}

/// First scheduling target of every new process: drop the table lock
/// the scheduler acquired before switching here, then fall through to
/// `trapret` (whose address sits on the prepared stack).
pub extern "C" fn forkret() {
    TABLE.lock.release_raw();
}
