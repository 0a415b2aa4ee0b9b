//! Per-CPU state, reached through the GS base register.
//!
//! The record layout is `#[repr(C)]` with `kernel_rsp` at offset 0 and
//! `scratch_rsp` at offset 8: the fast-syscall entry trampoline
//! addresses both through `gs:` with those literal offsets. Do not
//! reorder the leading fields.
//!
//! Only the bootstrap CPU is brought up; additional CPUs, if ever
//! enumerated, would park in a halt loop with their own records.

use core::cell::UnsafeCell;

use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::VirtAddr;

use super::context::Context;

pub const MAX_CPUS: usize = 16;

/// Per-CPU record. Pinned for the lifetime of the kernel.
#[repr(C)]
pub struct PerCpu {
    /// Offset 0: kernel stack top loaded by the syscall entry.
    pub kernel_rsp: u64,
    /// Offset 8: parking slot for the user RSP during syscall entry.
    pub scratch_rsp: u64,
    /// The process currently running on this CPU, or null.
    pub current: *mut crate::process::pcb::Process,
    /// The scheduler's saved context for this CPU.
    pub scheduler_ctx: *mut Context,
    /// Depth of pushcli nesting.
    pub ncli: u32,
    /// Were interrupts enabled before the first pushcli?
    pub intena: bool,
    pub apic_id: u8,
    pub cpu_id: u8,
}

impl PerCpu {
    const fn new(cpu_id: u8) -> Self {
        Self {
            kernel_rsp: 0,
            scratch_rsp: 0,
            current: core::ptr::null_mut(),
            scheduler_ctx: core::ptr::null_mut(),
            ncli: 0,
            intena: false,
            apic_id: 0,
            cpu_id,
        }
    }
}

struct CpuArray(UnsafeCell<[PerCpu; MAX_CPUS]>);

// SAFETY: each CPU only touches its own record (through its GS base);
// with a single active CPU there is no sharing at all.
unsafe impl Sync for CpuArray {}

static CPUS: CpuArray = {
    const INIT: PerCpu = PerCpu::new(0);
    CpuArray(UnsafeCell::new([INIT; MAX_CPUS]))
};

/// Program the bootstrap CPU's GS base. Must run before the first
/// spinlock acquisition or `mycpu` call.
pub fn init_bsp() {
    let base = CPUS.0.get() as u64;
    // SAFETY: cpu_id defaults are zeroed; slot 0 belongs to the BSP.
    unsafe {
        (*CPUS.0.get())[0].cpu_id = 0;
    }
    GsBase::write(VirtAddr::new(base));
    KernelGsBase::write(VirtAddr::new(base));
}

/// GDT reloads clear the GS base; restore it afterwards.
pub fn reload_gs_base() {
    let base = CPUS.0.get() as u64;
    GsBase::write(VirtAddr::new(base));
    KernelGsBase::write(VirtAddr::new(base));
}

/// The current CPU's record.
///
/// The returned borrow is only meaningful within a non-preemptible
/// section; with interrupts enabled a timer IRQ can switch away and the
/// fields may change underneath the caller.
#[allow(clippy::mut_from_ref)]
pub fn mycpu() -> &'static mut PerCpu {
    let base = GsBase::read().as_u64();
    debug_assert!(base != 0, "percpu: GS base not initialized");
    // SAFETY: init_bsp pointed GS at a pinned static record.
    unsafe { &mut *(base as *mut PerCpu) }
}

/// Identity of the executing CPU; 0 before per-CPU init.
pub fn cpu_id() -> u32 {
    let base = GsBase::read().as_u64();
    if base == 0 {
        return 0;
    }
    // SAFETY: non-zero GS base was installed by init_bsp.
    unsafe { (*(base as *const PerCpu)).cpu_id as u32 }
}

/// Disable interrupts, stacking the prior enable flag on first entry.
pub fn pushcli() {
    use x86_64::instructions::interrupts;
    let was_enabled = interrupts::are_enabled();
    interrupts::disable();
    let cpu = mycpu();
    if cpu.ncli == 0 {
        cpu.intena = was_enabled;
    }
    cpu.ncli += 1;
}

/// Undo one pushcli; re-enables interrupts when the outermost level is
/// popped and they were enabled to begin with. Misuse is a fatal bug.
pub fn popcli() {
    use x86_64::instructions::interrupts;
    if interrupts::are_enabled() {
        panic!("popcli: interrupts enabled");
    }
    let cpu = mycpu();
    if cpu.ncli == 0 {
        panic!("popcli: underflow");
    }
    cpu.ncli -= 1;
    if cpu.ncli == 0 && cpu.intena {
        interrupts::enable();
    }
}
