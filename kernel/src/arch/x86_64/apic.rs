//! Local and I/O interrupt controllers.
//!
//! The legacy PIC is remapped and then masked unconditionally; all
//! routing goes through the I/O APIC, programmed one redirection entry
//! at a time with ISA-to-GSI override translation. The periodic local
//! APIC timer drives the scheduler; the legacy interval timer is
//! stopped.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

use super::acpi;
use crate::error::KernelError;
use crate::mm::{paging, phys_to_virt, PAGE_SIZE};

// Local APIC registers (byte offsets).
const LAPIC_ID: u64 = 0x20;
const LAPIC_TPR: u64 = 0x80;
const LAPIC_EOI: u64 = 0xB0;
const LAPIC_SVR: u64 = 0xF0;
const LAPIC_TIMER_LVT: u64 = 0x320;
const LAPIC_TIMER_INIT: u64 = 0x380;
const LAPIC_TIMER_DIV: u64 = 0x3E0;

const LAPIC_SVR_ENABLE: u32 = 0x100;
const LAPIC_TIMER_PERIODIC: u32 = 0x20000;
const LAPIC_TIMER_DIV_16: u32 = 0x3;

// I/O APIC indirect access registers.
const IOAPIC_REGSEL: u64 = 0x00;
const IOAPIC_REGWIN: u64 = 0x10;
const IOAPIC_REG_VER: u32 = 0x01;
const IOAPIC_REDTBL_BASE: u32 = 0x10;
const IOAPIC_MASKED: u32 = 1 << 16;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(0); // virtual
static IOAPIC_BASE: AtomicU64 = AtomicU64::new(0); // virtual

fn lapic_read(reg: u64) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    // SAFETY: the LAPIC MMIO window was mapped uncached at init.
    unsafe { core::ptr::read_volatile((base + reg) as *const u32) }
}

fn lapic_write(reg: u64, val: u32) {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    // SAFETY: as above; register offsets are architectural.
    unsafe { core::ptr::write_volatile((base + reg) as *mut u32, val) }
}

fn ioapic_read(reg: u32) -> u32 {
    let base = IOAPIC_BASE.load(Ordering::Acquire);
    // SAFETY: indirect register access through the mapped window.
    unsafe {
        core::ptr::write_volatile((base + IOAPIC_REGSEL) as *mut u32, reg);
        core::ptr::read_volatile((base + IOAPIC_REGWIN) as *const u32)
    }
}

fn ioapic_write(reg: u32, val: u32) {
    let base = IOAPIC_BASE.load(Ordering::Acquire);
    // SAFETY: as above.
    unsafe {
        core::ptr::write_volatile((base + IOAPIC_REGSEL) as *mut u32, reg);
        core::ptr::write_volatile((base + IOAPIC_REGWIN) as *mut u32, val);
    }
}

/// Remap the legacy PIC away from the exception vectors, then mask it
/// for good; the I/O APIC owns all routing.
pub fn disable_pic() {
    use pic8259::ChainedPics;
    // SAFETY: standard 8259 initialization sequence on the canonical
    // ports; every IRQ line ends up masked.
    unsafe {
        let mut pics = ChainedPics::new(0x20, 0x28);
        pics.initialize();
        pics.disable();
    }
}

/// Map and enable the local APIC; the base comes from the MADT
/// (respecting an address-override entry).
pub fn init_lapic() -> Result<(), KernelError> {
    let madt = acpi::madt().ok_or(KernelError::Unsupported)?;

    paging::map_mmio(madt.lapic_addr, PAGE_SIZE as u64)?;
    LAPIC_BASE.store(phys_to_virt(madt.lapic_addr) as u64, Ordering::Release);

    lapic_write(
        LAPIC_SVR,
        LAPIC_SVR_ENABLE | super::idt::VEC_SPURIOUS as u32,
    );
    lapic_write(LAPIC_TPR, 0); // accept everything

    log::info!(target: "lapic", "enabled, id={}", lapic_id());
    Ok(())
}

/// Signal end-of-interrupt to the local APIC.
pub fn eoi() {
    lapic_write(LAPIC_EOI, 0);
}

pub fn lapic_id() -> u8 {
    (lapic_read(LAPIC_ID) >> 24) as u8
}

/// Map the I/O APIC named by the MADT and mask every redirection entry.
pub fn init_ioapic() -> Result<(), KernelError> {
    let madt = acpi::madt().ok_or(KernelError::Unsupported)?;
    let ioapic = madt.ioapics.first().ok_or(KernelError::Unsupported)?;

    paging::map_mmio(ioapic.addr, PAGE_SIZE as u64)?;
    IOAPIC_BASE.store(phys_to_virt(ioapic.addr) as u64, Ordering::Release);

    let max_redir = (ioapic_read(IOAPIC_REG_VER) >> 16) & 0xFF;
    for gsi in 0..=max_redir {
        ioapic_write(IOAPIC_REDTBL_BASE + gsi * 2, IOAPIC_MASKED);
        ioapic_write(IOAPIC_REDTBL_BASE + gsi * 2 + 1, 0);
    }

    log::info!(target: "ioapic", "mapped at {:#x}, {} entries", ioapic.addr, max_redir + 1);
    Ok(())
}

/// Route an ISA IRQ (via its GSI) to `vector` on `dest_lapic`.
pub fn route_irq(isa_irq: u8, vector: u8, dest_lapic: u8) {
    let gsi = acpi::irq_to_gsi(isa_irq);
    ioapic_write(
        IOAPIC_REDTBL_BASE + gsi * 2 + 1,
        (dest_lapic as u32) << 24,
    );
    ioapic_write(IOAPIC_REDTBL_BASE + gsi * 2, vector as u32);
}

pub fn mask_irq(isa_irq: u8) {
    let gsi = acpi::irq_to_gsi(isa_irq);
    let lo = ioapic_read(IOAPIC_REDTBL_BASE + gsi * 2);
    ioapic_write(IOAPIC_REDTBL_BASE + gsi * 2, lo | IOAPIC_MASKED);
}

/// Start the periodic local timer: divide-by-16, `initial` counts per
/// interrupt on `vector`.
pub fn lapic_timer_periodic(vector: u8, initial: u32) {
    lapic_write(LAPIC_TIMER_DIV, LAPIC_TIMER_DIV_16);
    lapic_write(LAPIC_TIMER_LVT, LAPIC_TIMER_PERIODIC | vector as u32);
    lapic_write(LAPIC_TIMER_INIT, initial);
}

/// Stop the legacy interval timer (one-shot with a zero reload).
pub fn pit_stop() {
    const PIT_CMD: u16 = 0x43;
    const PIT_CH0: u16 = 0x40;
    const PIT_CH0_ONESHOT: u8 = 0x30;
    // SAFETY: canonical PIT command sequence; the device is otherwise
    // unused.
    unsafe {
        Port::<u8>::new(PIT_CMD).write(PIT_CH0_ONESHOT);
        Port::<u8>::new(PIT_CH0).write(0);
        Port::<u8>::new(PIT_CH0).write(0);
    }
}
