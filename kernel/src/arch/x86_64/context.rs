//! Kernel context switch.
//!
//! The saved context is exactly the callee-saved register set plus the
//! return address, living at the top of the owning kernel stack. A
//! fresh process is made to "return" from the scheduler by prepopulating
//! its stack with a context whose saved RIP is `forkret` (which releases
//! the process-table lock and falls through to the trap trampoline).

/// Saved by `swtch`, restored when switching back. Memory order matches
/// the push sequence in the assembly below.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

/// Save the outgoing callee-saved context to `*old` and resume the
/// incoming one. Control returns to the instruction after the matching
/// `swtch` call on the other side.
///
/// # Safety
/// `old` must point at a writable slot; `new` must point at a context
/// built by `swtch` or by process creation, on a live kernel stack.
#[unsafe(naked)]
pub unsafe extern "C" fn swtch(old: *mut *mut Context, new: *const Context) {
    core::arch::naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp", // *old = current stack top (a Context)
        "mov rsp, rsi",   // switch to the incoming context
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}
