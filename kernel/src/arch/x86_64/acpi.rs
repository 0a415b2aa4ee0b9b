//! ACPI table extraction.
//!
//! Only the MADT is consumed: the local-APIC base (respecting any
//! type-5 address-override entry), each I/O APIC, each ISA-to-GSI
//! interrupt source override, and the enumerated local APIC ids.

use alloc::vec::Vec;

use spin::Once;

use crate::error::KernelError;
use crate::mm::phys_to_virt;

#[derive(Debug, Clone, Copy)]
pub struct IoApic {
    pub addr: u64,
    pub gsi_base: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct IrqOverride {
    pub source: u8,
    pub gsi: u32,
}

#[derive(Debug)]
pub struct MadtInfo {
    pub lapic_addr: u64,
    pub ioapics: Vec<IoApic>,
    pub overrides: Vec<IrqOverride>,
    pub lapic_ids: Vec<u8>,
}

static MADT: Once<MadtInfo> = Once::new();

pub fn madt() -> Option<&'static MadtInfo> {
    MADT.get()
}

/// Read a little-endian value out of mapped physical memory.
///
/// # Safety
/// `phys` must lie inside a mapped ACPI table.
unsafe fn read<T: Copy>(phys: u64) -> T {
    // SAFETY: per the function contract; tables are direct-mapped.
    unsafe { core::ptr::read_unaligned(phys_to_virt(phys) as *const T) }
}

fn sig_matches(phys: u64, expect: &[u8; 4]) -> bool {
    // SAFETY: the first 4 bytes of an SDT header are its signature.
    let sig: [u8; 4] = unsafe { read(phys) };
    &sig == expect
}

const SDT_HEADER_LEN: u64 = 36;

// MADT entry types.
const MADT_LAPIC: u8 = 0;
const MADT_IOAPIC: u8 = 1;
const MADT_ISO: u8 = 2;
const MADT_LAPIC_OVERRIDE: u8 = 5;

/// Walk from the RSDP to the MADT. The caller has direct-mapped the
/// RSDP page and the ACPI reclaimable regions already.
pub fn init(rsdp_phys: u64) -> Result<(), KernelError> {
    // RSDP: signature[8], checksum, oemid[6], revision @15, rsdt @16,
    // (rev >= 2) length @20, xsdt @24.
    let revision: u8 = unsafe { read(rsdp_phys + 15) };

    let madt_phys = if revision >= 2 {
        let xsdt: u64 = unsafe { read(rsdp_phys + 24) };
        find_table(xsdt, 8)
    } else {
        let rsdt: u32 = unsafe { read(rsdp_phys + 16) };
        find_table(rsdt as u64, 4)
    }
    .ok_or(KernelError::Unsupported)?;

    let info = parse_madt(madt_phys);
    log::info!(
        target: "acpi",
        "MADT: lapic={:#x} ioapics={} overrides={} cpus={}",
        info.lapic_addr,
        info.ioapics.len(),
        info.overrides.len(),
        info.lapic_ids.len()
    );
    MADT.call_once(|| info);
    Ok(())
}

/// Scan an RSDT (4-byte pointers) or XSDT (8-byte pointers) for the
/// "APIC" signature.
fn find_table(sdt_phys: u64, ptr_size: u64) -> Option<u64> {
    if sdt_phys == 0 {
        return None;
    }
    let length: u32 = unsafe { read(sdt_phys + 4) };
    let entries = (length as u64).saturating_sub(SDT_HEADER_LEN) / ptr_size;
    for i in 0..entries {
        let at = sdt_phys + SDT_HEADER_LEN + i * ptr_size;
        let entry_phys = if ptr_size == 8 {
            unsafe { read::<u64>(at) }
        } else {
            unsafe { read::<u32>(at) as u64 }
        };
        if entry_phys != 0 && sig_matches(entry_phys, b"APIC") {
            return Some(entry_phys);
        }
    }
    None
}

fn parse_madt(madt_phys: u64) -> MadtInfo {
    let length: u32 = unsafe { read(madt_phys + 4) };
    let mut info = MadtInfo {
        // Header (36) + local_apic_addr (4) + flags (4).
        lapic_addr: unsafe { read::<u32>(madt_phys + 36) } as u64,
        ioapics: Vec::new(),
        overrides: Vec::new(),
        lapic_ids: Vec::new(),
    };

    let mut at = madt_phys + 44;
    let end = madt_phys + length as u64;
    while at + 2 <= end {
        let entry_type: u8 = unsafe { read(at) };
        let entry_len: u8 = unsafe { read(at + 1) };
        if entry_len == 0 {
            break;
        }
        match entry_type {
            MADT_LAPIC => {
                let apic_id: u8 = unsafe { read(at + 3) };
                info.lapic_ids.push(apic_id);
            }
            MADT_IOAPIC => {
                info.ioapics.push(IoApic {
                    addr: unsafe { read::<u32>(at + 4) } as u64,
                    gsi_base: unsafe { read(at + 8) },
                });
            }
            MADT_ISO => {
                info.overrides.push(IrqOverride {
                    source: unsafe { read(at + 3) },
                    gsi: unsafe { read(at + 4) },
                });
            }
            MADT_LAPIC_OVERRIDE => {
                info.lapic_addr = unsafe { read(at + 4) };
            }
            _ => {}
        }
        at += entry_len as u64;
    }
    info
}

/// Translate an ISA IRQ to its global system interrupt, honoring any
/// override entry; with no override the GSI equals the IRQ.
pub fn irq_to_gsi(irq: u8) -> u32 {
    madt()
        .and_then(|m| {
            m.overrides
                .iter()
                .find(|o| o.source == irq)
                .map(|o| o.gsi)
        })
        .unwrap_or(irq as u32)
}
