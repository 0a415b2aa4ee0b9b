//! fork: duplicate the current process.
//!
//! The child gets a deep copy of the parent's user half (no sharing, no
//! copy-on-write), shares every open file through its reference count,
//! and is set up to return through `trapret` into user mode carrying
//! the parent's saved register set with `rax = 0`.

use super::creation::kstack_setup;
use super::pcb::ProcState;
use super::table::{current, TABLE};
use crate::arch::x86_64::gdt;
use crate::arch::x86_64::idt::TrapFrame;
use crate::error::KernelError;
use crate::mm::paging::AddressSpace;

/// Returns the child pid (in the parent).
pub fn fork() -> Result<u32, KernelError> {
    let parent = current().ok_or(KernelError::NoProcess)?;

    let child = TABLE.alloc().ok_or(KernelError::ProcessTableFull)?;

    let mut space = match AddressSpace::new_user() {
        Ok(space) => space,
        Err(e) => {
            TABLE.discard(child);
            return Err(e);
        }
    };
    let parent_space = parent.space.as_ref().ok_or(KernelError::NoProcess)?;
    if let Err(e) = space.copy_user_from(parent_space) {
        drop(space);
        TABLE.discard(child);
        return Err(e);
    }

    // The child resumes exactly where the parent's syscall will return,
    // with a zero return value. rcx/r11 mirror rip/rflags so both the
    // iretq and sysret paths agree on the state.
    // SAFETY: fork runs inside the parent's syscall; the saved area is
    // live on the parent's kernel stack.
    let saved = unsafe { parent.syscall_saved() };
    let sel = gdt::selectors();
    let tf = TrapFrame {
        rip: saved.rip,
        rsp: saved.user_rsp,
        rflags: saved.rflags,
        rcx: saved.rip,
        r11: saved.rflags,
        rbx: saved.rbx,
        rbp: saved.rbp,
        r12: saved.r12,
        r13: saved.r13,
        r14: saved.r14,
        r15: saved.r15,
        rdi: saved.rdi,
        rsi: saved.rsi,
        rdx: saved.rdx,
        r10: saved.r10,
        r8: saved.r8,
        r9: saved.r9,
        rax: 0, // fork() returns 0 in the child
        cs: sel.user_code.0 as u64,
        ss: sel.user_data.0 as u64,
        ..TrapFrame::ZERO
    };
    kstack_setup(child, &tf);
    child.space = Some(space);

    // Shared, reference-counted file handles.
    for (slot, parent_file) in child.files.iter_mut().zip(parent.files.iter()) {
        *slot = parent_file.clone();
    }

    child.name = parent.name.clone();
    child.ppid = parent.pid;
    child.brk = parent.brk;

    TABLE.lock.acquire_raw();
    child.state = ProcState::Runnable;
    TABLE.lock.release_raw();

    Ok(child.pid)
}
