//! Interrupt descriptor table, per-vector stubs and the common trap
//! trampoline.
//!
//! Every vector routes through one of two naked stubs: one pushes a
//! dummy error code plus the vector number, the variant for vectors
//! with a CPU-pushed error code pushes only the vector. The common
//! trampoline swaps GS when arriving from user mode, saves the general
//! purpose registers in [`TrapFrame`] order and calls `trap_dispatch`.
//! The return path is exported as `trapret`: freshly created processes
//! are pointed at it so their prewritten trap frame "returns" into user
//! mode.

use core::cell::UnsafeCell;

use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use super::gdt;

pub const IDT_ENTRIES: usize = 256;

// IRQ vector assignments (ISA IRQs remapped to start at 32).
pub const VEC_TIMER: u64 = 32;
pub const VEC_KEYBOARD: u64 = 33;
pub const VEC_MOUSE: u64 = 44;
pub const VEC_ATA_PRIMARY: u64 = 46;
pub const VEC_ATA_SECONDARY: u64 = 47;
pub const VEC_AHCI: u64 = 48;
pub const VEC_SPURIOUS: u8 = 0xFF;

/// Registers as laid out by the common trampoline. The field order is
/// ABI: the trampoline, the fork/exec paths and the panic printer all
/// address this layout by fixed offset.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// All-zero frame; process creation fills in the user slots.
    pub const ZERO: TrapFrame = TrapFrame {
        r15: 0,
        r14: 0,
        r13: 0,
        r12: 0,
        r11: 0,
        r10: 0,
        r9: 0,
        r8: 0,
        rbp: 0,
        rdi: 0,
        rsi: 0,
        rdx: 0,
        rcx: 0,
        rbx: 0,
        rax: 0,
        vector: 0,
        error_code: 0,
        rip: 0,
        cs: 0,
        rflags: 0,
        rsp: 0,
        ss: 0,
    };
}

/* ---- stubs and trampoline ---- */

/// Common save/dispatch/restore path. `trapret` is a public label: new
/// kernel stacks are built so that `forkret` returns straight into it.
#[unsafe(naked)]
pub unsafe extern "C" fn isr_common() {
    core::arch::naked_asm!(
        // Arriving from user mode? (CS RPL != 0; CS sits above the
        // vector and error words.)
        "test qword ptr [rsp + 24], 3",
        "jz 2f",
        "swapgs",
        "2:",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        // Restore path; also the entry point for new processes.
        ".global trapret",
        "trapret:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Drop the vector and error words.
        "add rsp, 16",
        "test qword ptr [rsp + 8], 3",
        "jz 3f",
        "swapgs",
        "3:",
        "iretq",
        dispatch = sym trap_dispatch,
    );
}

extern "C" {
    /// The restore half of [`isr_common`]; see the module docs.
    pub fn trapret();
}

/// Spurious interrupts get no EOI and no frame.
#[unsafe(naked)]
pub unsafe extern "C" fn isr_spurious() {
    core::arch::naked_asm!("iretq");
}

macro_rules! isr_stub {
    ($name:ident, $vec:literal) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                concat!("push ", stringify!($vec)),
                "jmp {common}",
                common = sym isr_common,
            );
        }
    };
}

// The CPU pushed an error code already; push only the vector.
macro_rules! isr_stub_err {
    ($name:ident, $vec:literal) => {
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                concat!("push ", stringify!($vec)),
                "jmp {common}",
                common = sym isr_common,
            );
        }
    };
}

isr_stub!(isr0, 0); // divide error
isr_stub!(isr1, 1); // debug
isr_stub!(isr2, 2); // NMI
isr_stub!(isr3, 3); // breakpoint
isr_stub!(isr4, 4); // overflow
isr_stub!(isr5, 5); // bound range
isr_stub!(isr6, 6); // invalid opcode
isr_stub!(isr7, 7); // device not available
isr_stub_err!(isr8, 8); // double fault
isr_stub!(isr9, 9); // coprocessor overrun (reserved)
isr_stub_err!(isr10, 10); // invalid TSS
isr_stub_err!(isr11, 11); // segment not present
isr_stub_err!(isr12, 12); // stack-segment fault
isr_stub_err!(isr13, 13); // general protection fault
isr_stub_err!(isr14, 14); // page fault
isr_stub!(isr15, 15);
isr_stub!(isr16, 16); // x87 FPU error
isr_stub_err!(isr17, 17); // alignment check
isr_stub!(isr18, 18); // machine check
isr_stub!(isr19, 19); // SIMD floating point
isr_stub!(isr20, 20); // virtualization
isr_stub_err!(isr21, 21); // control protection
isr_stub!(isr22, 22);
isr_stub!(isr23, 23);
isr_stub!(isr24, 24);
isr_stub!(isr25, 25);
isr_stub!(isr26, 26);
isr_stub!(isr27, 27);
isr_stub!(isr28, 28);
isr_stub!(isr29, 29);
isr_stub_err!(isr30, 30); // security exception
isr_stub!(isr31, 31);
isr_stub!(isr32, 32); // timer
isr_stub!(isr33, 33); // keyboard
isr_stub!(isr34, 34);
isr_stub!(isr35, 35);
isr_stub!(isr36, 36);
isr_stub!(isr37, 37);
isr_stub!(isr38, 38);
isr_stub!(isr39, 39);
isr_stub!(isr40, 40);
isr_stub!(isr41, 41);
isr_stub!(isr42, 42);
isr_stub!(isr43, 43);
isr_stub!(isr44, 44); // mouse
isr_stub!(isr45, 45);
isr_stub!(isr46, 46); // ATA primary
isr_stub!(isr47, 47); // ATA secondary
isr_stub!(isr48, 48); // AHCI

static ISR_TABLE: [unsafe extern "C" fn(); 49] = [
    isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12, isr13, isr14,
    isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24, isr25, isr26, isr27,
    isr28, isr29, isr30, isr31, isr32, isr33, isr34, isr35, isr36, isr37, isr38, isr39, isr40,
    isr41, isr42, isr43, isr44, isr45, isr46, isr47, isr48,
];

/* ---- table ---- */

const GATE_INTERRUPT: u8 = 0x8E; // present, ring 0, interrupt gate

#[repr(C)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn empty() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set(&mut self, handler: u64, selector: u16, type_attr: u8, ist: u8) {
        self.offset_low = handler as u16;
        self.selector = selector;
        self.ist = ist;
        self.type_attr = type_attr;
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
        self.reserved = 0;
    }
}

struct IdtStorage(UnsafeCell<[IdtEntry; IDT_ENTRIES]>);

// SAFETY: written once during single-threaded boot, then only read by
// the CPU's interrupt delivery.
unsafe impl Sync for IdtStorage {}

static IDT: IdtStorage = IdtStorage(UnsafeCell::new([IdtEntry::empty(); IDT_ENTRIES]));

/// Build and load the IDT. Runs once on the BSP after the GDT is up.
pub fn init() {
    let kernel_cs = gdt::selectors().kernel_code.0;
    // SAFETY: single-threaded boot; nothing reads the table before lidt.
    let idt = unsafe { &mut *IDT.0.get() };

    for (vector, &stub) in ISR_TABLE.iter().enumerate() {
        idt[vector].set(stub as u64, kernel_cs, GATE_INTERRUPT, 0);
    }
    // The double fault handler runs on its own known-good stack.
    idt[8].set(
        isr8 as u64,
        kernel_cs,
        GATE_INTERRUPT,
        gdt::DOUBLE_FAULT_IST_INDEX as u8 + 1,
    );
    idt[VEC_SPURIOUS as usize].set(isr_spurious as u64, kernel_cs, GATE_INTERRUPT, 0);

    let ptr = DescriptorTablePointer {
        limit: (core::mem::size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
        base: VirtAddr::new(IDT.0.get() as u64),
    };
    // SAFETY: the table is a pinned static and stays valid forever.
    unsafe {
        x86_64::instructions::tables::lidt(&ptr);
    }
}

/* ---- dispatch ---- */

static EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 FPU error",
    "alignment check",
    "machine check",
    "SIMD floating point",
    "virtualization",
    "control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication",
    "security exception",
    "reserved",
];

/// Demultiplex one trap: device IRQs to their drivers (plus EOI),
/// the timer to the scheduler, architectural exceptions to the panic
/// printer.
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    use super::apic;

    match frame.vector {
        VEC_TIMER => {
            apic::eoi();
            crate::sched::timer_tick();
        }
        VEC_KEYBOARD => {
            crate::drivers::ps2::keyboard_interrupt();
            apic::eoi();
        }
        VEC_MOUSE => {
            crate::drivers::ps2::mouse_interrupt();
            apic::eoi();
        }
        VEC_ATA_PRIMARY => {
            crate::drivers::ata::irq_handler(0);
            apic::eoi();
        }
        VEC_ATA_SECONDARY => {
            crate::drivers::ata::irq_handler(1);
            apic::eoi();
        }
        VEC_AHCI => {
            crate::drivers::ahci::irq_handler();
            apic::eoi();
        }
        v if v < 32 => {
            crate::panic::trap_panic(EXCEPTION_NAMES[v as usize], frame);
        }
        v => {
            log::warn!(target: "trap", "unexpected vector {}", v);
            apic::eoi();
        }
    }
}
