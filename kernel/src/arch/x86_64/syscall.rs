//! Fast-syscall entry path (SYSCALL/SYSRET).
//!
//! User convention: syscall number in RDI, arguments in RSI, RDX, R10,
//! R8, R9 (R10 stands in for RCX, which the SYSCALL instruction
//! clobbers with the return RIP). The entry trampoline parks the user
//! RSP in the per-CPU scratch slot, switches to the process's kernel
//! stack and saves state in a fixed layout addressed from the stack
//! top:
//!
//! ```text
//!   top-8   user RSP          top-56  r13        top-104 r10
//!   top-16  user RIP (rcx)    top-64  r14        top-112 r8
//!   top-24  user RFLAGS (r11) top-72  r15        top-120 r9
//!   top-32  rbx               top-80  rdi
//!   top-40  rbp               top-88  rsi
//!   top-48  r12               top-96  rdx
//! ```
//!
//! exec rewrites the three words at top-8/-16/-24 so the impending
//! SYSRET transfers control into the freshly loaded image; fork reads
//! the whole area to seed the child's trap frame. The layout is
//! mirrored by `process::pcb::SyscallSavedFrame` — keep them in sync.

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use super::gdt;

/// Enable SYSCALL/SYSRET and point the MSRs at the entry trampoline.
pub fn init() {
    let sel = gdt::selectors();
    // SAFETY: MSR writes configuring the syscall mechanism; the segment
    // selector layout satisfies the STAR constraints (see gdt).
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        Star::write(sel.user_code, sel.user_data, sel.kernel_code, sel.kernel_data)
            .expect("STAR selector layout");
        // Interrupts stay off until the handler chooses to wait.
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
    log::info!(target: "syscall", "MSRs configured");
}

/// SYSCALL entry trampoline.
///
/// # Safety
/// Reached only via the SYSCALL instruction with the register state
/// that mechanism defines.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "swapgs",
        "mov gs:[8], rsp",  // park user RSP in the per-CPU scratch slot
        "mov rsp, gs:[0]",  // adopt this process's kernel stack
        "push qword ptr gs:[8]", // user RSP       @ top-8
        "push rcx",              // user RIP       @ top-16
        "push r11",              // user RFLAGS    @ top-24
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push rdi",
        "push rsi",
        "push rdx",
        "push r10",
        "push r8",
        "push r9",
        // rdi = number, rsi/rdx already in place; the fourth argument
        // travels in r10 and is remapped into the C ABI's rcx.
        "mov rcx, r10",
        // 15 qwords are parked on a 16-aligned stack top; realign for
        // the call.
        "sub rsp, 8",
        "call {dispatch}",
        "add rsp, 8",
        "pop r9",
        "pop r8",
        "pop r10",
        "pop rdx",
        "pop rsi",
        "pop rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "pop r11", // user RFLAGS (possibly patched by exec)
        "pop rcx", // user RIP    (possibly patched by exec)
        "pop rsp", // user RSP    (possibly patched by exec)
        "swapgs",
        "sysretq",
        dispatch = sym crate::syscall::syscall_dispatch,
    );
}
