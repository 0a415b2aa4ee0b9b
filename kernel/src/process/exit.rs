//! exit: become a zombie and hand the CPU back to the scheduler.

use super::pcb::ProcState;
use super::table::{current, TABLE};
use crate::arch::x86_64::context::swtch;
use crate::arch::x86_64::percpu;

/// Terminate the current process with `status`. Never returns: the
/// zombie waits for its parent's `wait` to reap it.
pub fn exit(status: i32) -> ! {
    let Some(p) = current() else {
        panic!("exit: no current process");
    };

    // Drop the file references before taking the table lock; closing a
    // pipe end may free backing memory.
    p.close_fds();

    let cpu = percpu::mycpu();
    TABLE.lock.acquire_raw();
    p.exit_code = status;
    p.state = ProcState::Zombie;
    cpu.current = core::ptr::null_mut();

    log::debug!(target: "proc", "pid {} exited with {}", p.pid, status);

    // SAFETY: the scheduler context was saved by the scheduler loop on
    // this CPU; the table lock travels across the switch.
    unsafe {
        swtch(&mut p.context, cpu.scheduler_ctx);
    }
    panic!("exit: zombie was scheduled again");
}
