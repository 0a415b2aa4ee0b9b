//! AHCI SATA driver, interrupt-driven.
//!
//! One command slot per port. Submit builds a host-to-device register
//! FIS plus a single-entry PRD table aimed at the request buffer and
//! issues the slot; the MSI-routed interrupt handler reads the port
//! interrupt status and completes the request. Port setup allocates the
//! command list, received-FIS area and command table out of one buddy
//! page per port.

use core::ptr::{read_volatile, write_volatile};

use crate::arch::x86_64::idt::VEC_AHCI;
use crate::block::{self, BlockDevice, BlockDriver, BlockRequest};
use crate::drivers::pci;
use crate::error::KernelError;
use crate::mm::{paging, phys_to_virt, virt_to_phys, FRAME_ALLOCATOR, PAGE_SIZE};

// HBA memory registers (byte offsets from ABAR).
const HBA_CAP: u64 = 0x00;
const HBA_GHC: u64 = 0x04;
const HBA_IS: u64 = 0x08;
const HBA_PI: u64 = 0x0C;
const HBA_PORT_BASE: u64 = 0x100;
const HBA_PORT_SPAN: u64 = 0x80;

const GHC_AHCI_ENABLE: u32 = 1 << 31;
const GHC_IRQ_ENABLE: u32 = 1 << 1;

// Per-port registers.
const PORT_CLB: u64 = 0x00;
const PORT_CLBU: u64 = 0x04;
const PORT_FB: u64 = 0x08;
const PORT_FBU: u64 = 0x0C;
const PORT_IS: u64 = 0x10;
const PORT_IE: u64 = 0x14;
const PORT_CMD: u64 = 0x18;
const PORT_TFD: u64 = 0x20;
const PORT_SIG: u64 = 0x24;
const PORT_SSTS: u64 = 0x28;
const PORT_SERR: u64 = 0x30;
const PORT_CI: u64 = 0x38;

const CMD_ST: u32 = 1 << 0; // start
const CMD_FRE: u32 = 1 << 4; // FIS receive enable
const CMD_FR: u32 = 1 << 14; // FIS receive running
const CMD_CR: u32 = 1 << 15; // command list running

const IS_TFES: u32 = 1 << 30; // task file error
const IE_DHRE: u32 = 1 << 0; // device-to-host register FIS
const IE_TFEE: u32 = 1 << 30;

const SIG_SATA: u32 = 0x0000_0101;
const SSTS_DET_PRESENT: u32 = 3;

const FIS_TYPE_REG_H2D: u8 = 0x27;
const FIS_H2D_CMD: u8 = 1 << 7;

const ATA_CMD_READ_DMA_EXT: u8 = 0x25;
const ATA_CMD_WRITE_DMA_EXT: u8 = 0x35;
const ATA_CMD_IDENTIFY: u8 = 0xEC;

const TFD_BSY: u32 = 0x80;
const TFD_DRQ: u32 = 0x08;

/// Layout of the per-port DMA page (one buddy page):
///   +0     command list (32 headers * 32 bytes = 1024)
///   +1024  received FIS area (256)
///   +2048  command table: CFIS (64) + ACMD (16) + reserved (48) + PRDT
const CMDLIST_OFF: u64 = 0;
const FIS_OFF: u64 = 1024;
const CMDTABLE_OFF: u64 = 2048;
const PRDT_OFF: u64 = CMDTABLE_OFF + 0x80;

struct AhciPort {
    regs: u64,     // virtual base of this port's registers
    dma_phys: u64, // physical base of the per-port DMA page
    sector_size: u32,
}

// SAFETY: register and DMA-page access is serialized by the block
// core's single-outstanding-request invariant.
unsafe impl Send for AhciPort {}
unsafe impl Sync for AhciPort {}

impl AhciPort {
    fn read(&self, reg: u64) -> u32 {
        // SAFETY: mapped uncached port register.
        unsafe { read_volatile((self.regs + reg) as *const u32) }
    }

    fn write(&self, reg: u64, val: u32) {
        // SAFETY: as above.
        unsafe { write_volatile((self.regs + reg) as *mut u32, val) }
    }

    fn stop(&self) {
        self.write(PORT_CMD, self.read(PORT_CMD) & !(CMD_ST | CMD_FRE));
        while self.read(PORT_CMD) & (CMD_CR | CMD_FR) != 0 {
            core::hint::spin_loop();
        }
    }

    fn start(&self) {
        while self.read(PORT_CMD) & CMD_CR != 0 {
            core::hint::spin_loop();
        }
        self.write(PORT_CMD, self.read(PORT_CMD) | CMD_FRE | CMD_ST);
    }

    /// Fill slot 0's command header, FIS and PRD for one transfer.
    ///
    /// # Safety
    /// `buf_phys` must reference `byte_len` bytes of DMA-reachable
    /// memory owned by the caller for the duration of the command.
    unsafe fn program_slot(&self, command: u8, lba: u64, count: u16, buf_phys: u64, byte_len: u32, write: bool) {
        let dma = phys_to_virt(self.dma_phys) as u64;

        // Command header 0: 5 dword FIS, one PRDT entry, W bit.
        let header = (dma + CMDLIST_OFF) as *mut u32;
        // SAFETY: the DMA page is owned by this port.
        unsafe {
            write_volatile(header, (5u32) | ((write as u32) << 6) | (1 << 16));
            write_volatile(header.add(1), 0); // PRD byte count, set by HW
            write_volatile(header.add(2), (self.dma_phys + CMDTABLE_OFF) as u32);
            write_volatile(header.add(3), ((self.dma_phys + CMDTABLE_OFF) >> 32) as u32);
        }

        // Command FIS: host-to-device register FIS.
        let cfis = (dma + CMDTABLE_OFF) as *mut u8;
        // SAFETY: CFIS area of the command table.
        unsafe {
            core::ptr::write_bytes(cfis, 0, 64);
            write_volatile(cfis, FIS_TYPE_REG_H2D);
            write_volatile(cfis.add(1), FIS_H2D_CMD);
            write_volatile(cfis.add(2), command);
            write_volatile(cfis.add(4), lba as u8);
            write_volatile(cfis.add(5), (lba >> 8) as u8);
            write_volatile(cfis.add(6), (lba >> 16) as u8);
            write_volatile(cfis.add(7), 0x40); // LBA mode
            write_volatile(cfis.add(8), (lba >> 24) as u8);
            write_volatile(cfis.add(9), (lba >> 32) as u8);
            write_volatile(cfis.add(10), (lba >> 40) as u8);
            write_volatile(cfis.add(12), count as u8);
            write_volatile(cfis.add(13), (count >> 8) as u8);
        }

        // One PRD entry covering the whole buffer.
        let prd = (dma + PRDT_OFF) as *mut u32;
        // SAFETY: PRDT area of the command table.
        unsafe {
            write_volatile(prd, buf_phys as u32);
            write_volatile(prd.add(1), (buf_phys >> 32) as u32);
            write_volatile(prd.add(2), 0);
            write_volatile(prd.add(3), byte_len - 1); // byte count - 1
        }
    }

    fn issue_and_wait_polled(&self) -> Result<(), KernelError> {
        self.write(PORT_IS, u32::MAX);
        self.write(PORT_CI, 1);
        loop {
            if self.read(PORT_IS) & IS_TFES != 0 {
                return Err(KernelError::Io);
            }
            if self.read(PORT_CI) & 1 == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
    }
}

impl BlockDriver for AhciPort {
    fn submit(&self, _dev: &BlockDevice, req: &BlockRequest) -> Result<(), KernelError> {
        if req.count == 0 || req.count > u16::MAX as u32 {
            return Err(KernelError::Io);
        }
        let byte_len = req.count * self.sector_size;
        if byte_len as u64 > 4 * 1024 * 1024 {
            return Err(KernelError::Io); // beyond a single PRD entry
        }
        while self.read(PORT_TFD) & (TFD_BSY | TFD_DRQ) != 0 {
            core::hint::spin_loop();
        }

        let buf_phys = virt_to_phys(req.buf as u64);
        let command = if req.write {
            ATA_CMD_WRITE_DMA_EXT
        } else {
            ATA_CMD_READ_DMA_EXT
        };
        // SAFETY: the block core guarantees the buffer outlives the
        // request; kernel buffers live in the direct map.
        unsafe {
            self.program_slot(command, req.lba, req.count as u16, buf_phys, byte_len, req.write);
        }

        self.write(PORT_IS, u32::MAX);
        self.write(PORT_CI, 1);
        // Completion arrives through the interrupt handler.
        Ok(())
    }
}

/// Registered ports, for the interrupt handler to walk.
static PORTS: spin::RwLock<
    alloc::vec::Vec<(&'static AhciPort, &'static BlockDevice)>,
> = spin::RwLock::new(alloc::vec::Vec::new());

/// MSI handler: check every active port for a finished or failed slot.
pub fn irq_handler() {
    for (port, dev) in PORTS.read().iter() {
        let is = port.read(PORT_IS);
        if is == 0 {
            continue;
        }
        port.write(PORT_IS, is);
        if is & IS_TFES != 0 {
            port.write(PORT_SERR, u32::MAX);
            dev.complete(-5);
        } else if port.read(PORT_CI) & 1 == 0 && !dev.current_request().is_null() {
            dev.complete(0);
        }
    }
}

fn hba_read(abar_virt: u64, reg: u64) -> u32 {
    // SAFETY: mapped uncached HBA register.
    unsafe { read_volatile((abar_virt + reg) as *const u32) }
}

fn hba_write(abar_virt: u64, reg: u64, val: u32) {
    // SAFETY: as above.
    unsafe { write_volatile((abar_virt + reg) as *mut u32, val) }
}

fn sector_size_from_identify(id: &[u16]) -> u32 {
    let w106 = id[106];
    if w106 & 0xC000 == 0x4000 && w106 & (1 << 12) != 0 {
        let words = (id[117] as u32) | ((id[118] as u32) << 16);
        if words >= 256 {
            return words * 2;
        }
    }
    512
}

fn setup_port(abar_virt: u64, index: u32) -> Result<(), KernelError> {
    let port = AhciPort {
        regs: abar_virt + HBA_PORT_BASE + index as u64 * HBA_PORT_SPAN,
        dma_phys: 0,
        sector_size: 512,
    };

    if port.read(PORT_SSTS) & 0xF != SSTS_DET_PRESENT || port.read(PORT_SIG) != SIG_SATA {
        return Ok(()); // empty or non-SATA port
    }

    let mut port = port;
    port.stop();

    let dma_page = FRAME_ALLOCATOR
        .alloc_pages(1)
        .ok_or(KernelError::OutOfMemory)?;
    // SAFETY: fresh page, exclusively owned by this port.
    unsafe { core::ptr::write_bytes(dma_page.as_ptr(), 0, PAGE_SIZE) };
    port.dma_phys = virt_to_phys(dma_page.as_ptr() as u64);

    port.write(PORT_CLB, (port.dma_phys + CMDLIST_OFF) as u32);
    port.write(PORT_CLBU, ((port.dma_phys + CMDLIST_OFF) >> 32) as u32);
    port.write(PORT_FB, (port.dma_phys + FIS_OFF) as u32);
    port.write(PORT_FBU, ((port.dma_phys + FIS_OFF) >> 32) as u32);
    port.write(PORT_SERR, u32::MAX);
    port.write(PORT_IS, u32::MAX);
    port.start();

    // IDENTIFY, polled: interrupts are not routed yet during init.
    let ident = FRAME_ALLOCATOR
        .alloc_pages(1)
        .ok_or(KernelError::OutOfMemory)?;
    let ident_phys = virt_to_phys(ident.as_ptr() as u64);
    // SAFETY: the identify buffer page is exclusively ours.
    unsafe {
        port.program_slot(ATA_CMD_IDENTIFY, 0, 0, ident_phys, 512, false);
    }
    let result = port.issue_and_wait_polled();
    let id_words: &[u16] =
        // SAFETY: 512 bytes of identify data in our page.
        unsafe { core::slice::from_raw_parts(ident.as_ptr() as *const u16, 256) };
    if result.is_ok() {
        port.sector_size = sector_size_from_identify(id_words);
    }
    let sectors = (id_words[100] as u64)
        | ((id_words[101] as u64) << 16)
        | ((id_words[102] as u64) << 32)
        | ((id_words[103] as u64) << 48);
    FRAME_ALLOCATOR.free_pages(ident, 1);
    result?;

    // Interrupt on D2H FIS and on task-file errors.
    port.write(PORT_IE, IE_DHRE | IE_TFEE);

    let sector_size = port.sector_size;
    let port: &'static AhciPort = alloc::boxed::Box::leak(alloc::boxed::Box::new(port));
    let name = alloc::format!("ahci{}", PORTS.read().len());
    let dev = block::register(&name, sector_size, port)?;
    PORTS.write().push((port, dev));
    let _ = crate::fs::devfs::register_block_device(dev);

    log::info!(
        target: "ahci",
        "{}: {} sectors of {} bytes",
        name, sectors, sector_size
    );
    Ok(())
}

/// Find the AHCI controller, map its registers and bring up every
/// implemented SATA port.
pub fn init() {
    let Some(dev) = pci::find_class(pci::CLASS_STORAGE, pci::SUBCLASS_SATA) else {
        log::info!(target: "ahci", "no controller");
        return;
    };
    dev.enable_mastering();

    let abar_phys = dev.bar(5);
    if abar_phys == 0 {
        log::error!(target: "ahci", "ABAR not assigned");
        return;
    }
    if paging::map_mmio(abar_phys, 0x1100).is_err() {
        log::error!(target: "ahci", "cannot map ABAR");
        return;
    }
    let abar_virt = phys_to_virt(abar_phys) as u64;

    hba_write(abar_virt, HBA_GHC, hba_read(abar_virt, HBA_GHC) | GHC_AHCI_ENABLE);

    let implemented = hba_read(abar_virt, HBA_PI);
    for index in 0..32 {
        if implemented & (1 << index) != 0 {
            if let Err(e) = setup_port(abar_virt, index) {
                log::error!(target: "ahci", "port {}: {}", index, e);
            }
        }
    }

    if PORTS.read().is_empty() {
        return;
    }

    // Route completions as an MSI onto the AHCI vector.
    if dev.enable_msi(VEC_AHCI as u8, crate::arch::x86_64::apic::lapic_id()).is_err() {
        log::warn!(target: "ahci", "MSI unavailable, completions will rely on polling");
    }
    hba_write(abar_virt, HBA_GHC, hba_read(abar_virt, HBA_GHC) | GHC_IRQ_ENABLE);
    hba_write(abar_virt, HBA_IS, u32::MAX);
}
