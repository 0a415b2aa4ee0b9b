//! wait: reap a zombie child.

use core::ptr::NonNull;

use super::pcb::ProcState;
use super::table::{current, TABLE};
use super::{KSTACK_PAGES, MAX_PROCS};
use crate::error::KernelError;
use crate::mm::FRAME_ALLOCATOR;

/// Block until some child has exited; frees the child's address space
/// and kernel stack and returns `(pid, exit_code)`.
pub fn wait() -> Result<(u32, i32), KernelError> {
    let parent = current().ok_or(KernelError::NoProcess)?;

    loop {
        TABLE.lock.acquire_raw();
        for index in 0..MAX_PROCS {
            // SAFETY: table lock held.
            let child = unsafe { TABLE.slot(index) };
            if child.state != ProcState::Zombie || child.ppid != parent.pid {
                continue;
            }

            let pid = child.pid;
            let status = child.exit_code;

            // Reap: release the address space and the kernel stack,
            // then free the slot.
            child.space = None;
            if let Some(kstack) = NonNull::new(child.kstack) {
                FRAME_ALLOCATOR.free_pages(kstack, KSTACK_PAGES);
            }
            child.kstack = core::ptr::null_mut();
            child.context = core::ptr::null_mut();
            child.state = ProcState::Unused;

            TABLE.lock.release_raw();
            return Ok((pid, status));
        }
        TABLE.lock.release_raw();

        // No zombie child yet; give the children a chance to run.
        crate::sched::yield_now();
    }
}
