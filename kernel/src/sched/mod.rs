//! The scheduler.
//!
//! A single run queue over the process table. Each round, with the
//! table lock held, the first runnable process is marked running,
//! installed as the per-CPU current, its address space loaded, the TSS
//! and per-CPU kernel stack pointed at its kernel stack, and control
//! switched into its saved context. Preemption happens only at
//! interrupt boundaries: the timer IRQ sends EOI and then yields
//! unconditionally.

use crate::arch::x86_64::context::swtch;
use crate::arch::x86_64::{gdt, percpu};
use crate::mm::paging;
use crate::process::pcb::ProcState;
use crate::process::table::TABLE;
use crate::process::MAX_PROCS;

/// Per-CPU scheduling loop; never returns. The table lock is held
/// across `swtch` and released on the other side (by `forkret` for a
/// first run, by the tail of `yield_now`/`exit` otherwise).
pub fn scheduler() -> ! {
    let cpu = percpu::mycpu();
    loop {
        // Let pending interrupts (and so completions and keystrokes)
        // land between rounds.
        x86_64::instructions::interrupts::enable();

        TABLE.lock.acquire_raw();
        for index in 0..MAX_PROCS {
            // SAFETY: table lock held.
            let p = unsafe { TABLE.slot(index) };
            if p.state != ProcState::Runnable || p.space.is_none() {
                continue;
            }

            p.state = ProcState::Running;
            cpu.current = p as *mut _;

            if let Some(space) = p.space.as_ref() {
                paging::activate(space);
            }
            gdt::set_kernel_stack(p.kstack_top());
            cpu.kernel_rsp = p.kstack_top();

            // SAFETY: p.context was built by kstack_setup or saved by a
            // prior swtch on p's own kernel stack.
            unsafe {
                swtch(&mut cpu.scheduler_ctx, p.context);
            }

            cpu.current = core::ptr::null_mut();
        }
        TABLE.lock.release_raw();
    }
}

/// Give up the CPU: mark the current process runnable and switch to the
/// scheduler context. No-op outside process context (early boot, or an
/// interrupt that landed in the scheduler loop itself).
pub fn yield_now() {
    let cpu = percpu::mycpu();
    if cpu.current.is_null() {
        return;
    }
    // SAFETY: current points at a live table slot set by the scheduler.
    let p = unsafe { &mut *cpu.current };

    TABLE.lock.acquire_raw();
    p.state = ProcState::Runnable;
    // SAFETY: both contexts live on valid kernel stacks; the table lock
    // travels across the switch and is released on the scheduler side.
    unsafe {
        swtch(&mut p.context, cpu.scheduler_ctx);
    }
    TABLE.lock.release_raw();
}

/// Timer interrupt hook: preempt whatever is running.
pub fn timer_tick() {
    yield_now();
}
