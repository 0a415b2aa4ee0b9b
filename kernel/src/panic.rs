//! Fatal-fault reporting.
//!
//! Unhandled CPU exceptions format the trap frame, the control
//! registers and a best-effort frame-pointer backtrace, then disable
//! interrupts and halt. Programming invariants (lock misuse, popcli
//! underflow) reach the same path through `panic!`.

use crate::arch::x86_64::idt::TrapFrame;

/// Print the saved register file and control registers.
fn dump_frame(frame: &TrapFrame) {
    use x86_64::registers::control::{Cr0, Cr2, Cr3};

    let cr0 = Cr0::read_raw();
    let cr2 = Cr2::read_raw();
    let cr3 = Cr3::read().0.start_address().as_u64();

    println!(
        "vector={:#x} error={:#x}",
        frame.vector, frame.error_code
    );
    println!("RIP={:#018x} CS={:#06x} RFLAGS={:#010x}", frame.rip, frame.cs, frame.rflags);
    println!("RSP={:#018x} SS={:#06x}", frame.rsp, frame.ss);
    println!("RAX={:#018x} RBX={:#018x} RCX={:#018x}", frame.rax, frame.rbx, frame.rcx);
    println!("RDX={:#018x} RSI={:#018x} RDI={:#018x}", frame.rdx, frame.rsi, frame.rdi);
    println!("RBP={:#018x} R8 ={:#018x} R9 ={:#018x}", frame.rbp, frame.r8, frame.r9);
    println!("R10={:#018x} R11={:#018x} R12={:#018x}", frame.r10, frame.r11, frame.r12);
    println!("R13={:#018x} R14={:#018x} R15={:#018x}", frame.r13, frame.r14, frame.r15);
    println!("CR0={:#018x} CR2={:#018x} CR3={:#018x}", cr0, cr2, cr3);
}

/// Walk the frame-pointer chain. Stops at the first implausible link.
fn dump_backtrace(mut rbp: u64) {
    println!("backtrace:");
    for depth in 0..16 {
        if rbp == 0 || rbp % 8 != 0 {
            break;
        }
        // SAFETY: best effort; an unmapped rbp would double-fault, but
        // the chain starts from a trusted trap frame and frames live on
        // mapped kernel stacks.
        let (next_rbp, ret) = unsafe { (*(rbp as *const u64), *((rbp + 8) as *const u64)) };
        if ret == 0 {
            break;
        }
        println!("  #{:02} {:#018x}", depth, ret);
        if next_rbp <= rbp {
            break;
        }
        rbp = next_rbp;
    }
}

/// Terminal handler for an unhandled exception.
pub fn trap_panic(name: &str, frame: &TrapFrame) -> ! {
    x86_64::instructions::interrupts::disable();
    println!();
    println!("======================== PANIC ========================");
    println!("exception: {}", name);
    dump_frame(frame);
    dump_backtrace(frame.rbp);
    println!("=======================================================");
    crate::arch::x86_64::halt();
}
