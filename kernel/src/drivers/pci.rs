//! PCI configuration-space access and bus enumeration.
//!
//! Legacy port-based config mechanism (0xCF8/0xCFC), a recursive scan
//! across bridges, BAR decoding (32/64-bit memory BARs) and MSI
//! capability programming for drivers that want a direct vector.

use alloc::vec::Vec;

use spin::{Mutex, RwLock};
use x86_64::instructions::port::Port;

pub const CONFIG_ADDR: u16 = 0xCF8;
pub const CONFIG_DATA: u16 = 0xCFC;

pub const CLASS_STORAGE: u8 = 0x01;
pub const SUBCLASS_SATA: u8 = 0x06;
pub const SUBCLASS_IDE: u8 = 0x01;

const STATUS_OFFSET: u8 = 0x06;
const COMMAND_OFFSET: u8 = 0x04;
const BAR0_OFFSET: u8 = 0x10;
const CAP_PTR_OFFSET: u8 = 0x34;
const HEADER_TYPE_OFFSET: u8 = 0x0E;
const INT_LINE_OFFSET: u8 = 0x3C;

const STATUS_CAP_LIST: u16 = 1 << 4;
const CAP_MSI: u8 = 0x05;
const MSI_CTRL_ENABLE: u16 = 1 << 0;
const MSI_CTRL_64BIT: u16 = 1 << 7;
const MSI_CTRL_MME_MASK: u16 = 0x70;
const MSI_ADDR_BASE: u32 = 0xFEE0_0000;

const BAR_TYPE_MASK: u32 = 0x6;
const BAR_TYPE_64BIT: u32 = 0x4;
const BAR_ADDR_MASK: u64 = !0xF;

fn config_address(bus: u8, slot: u8, func: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((slot as u32) << 11)
        | ((func as u32) << 8)
        | (offset as u32 & 0xFC)
}

/// Config-space port pair; a lock serializes the address/data sequence.
static CONFIG_PORTS: Mutex<()> = Mutex::new(());

pub fn read32(bus: u8, slot: u8, func: u8, offset: u8) -> u32 {
    let _guard = CONFIG_PORTS.lock();
    // SAFETY: canonical config mechanism; the lock keeps the
    // address/data pair atomic.
    unsafe {
        Port::<u32>::new(CONFIG_ADDR).write(config_address(bus, slot, func, offset));
        Port::<u32>::new(CONFIG_DATA).read()
    }
}

pub fn write32(bus: u8, slot: u8, func: u8, offset: u8, val: u32) {
    let _guard = CONFIG_PORTS.lock();
    // SAFETY: as above.
    unsafe {
        Port::<u32>::new(CONFIG_ADDR).write(config_address(bus, slot, func, offset));
        Port::<u32>::new(CONFIG_DATA).write(val);
    }
}

pub fn read16(bus: u8, slot: u8, func: u8, offset: u8) -> u16 {
    (read32(bus, slot, func, offset) >> ((offset & 2) * 8)) as u16
}

pub fn read8(bus: u8, slot: u8, func: u8, offset: u8) -> u8 {
    (read32(bus, slot, func, offset) >> ((offset & 3) * 8)) as u8
}

pub fn write16(bus: u8, slot: u8, func: u8, offset: u8, val: u16) {
    let shift = (offset & 2) * 8;
    let old = read32(bus, slot, func, offset);
    let new = (old & !(0xFFFFu32 << shift)) | ((val as u32) << shift);
    write32(bus, slot, func, offset, new);
}

#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bus: u8,
    pub slot: u8,
    pub func: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub int_line: u8,
}

impl PciDevice {
    pub fn read32(&self, offset: u8) -> u32 {
        read32(self.bus, self.slot, self.func, offset)
    }

    pub fn write32(&self, offset: u8, val: u32) {
        write32(self.bus, self.slot, self.func, offset, val);
    }

    /// Decode a memory BAR, following into the next slot for 64-bit
    /// BARs. Returns the physical base address.
    pub fn bar(&self, index: u8) -> u64 {
        let offset = BAR0_OFFSET + index * 4;
        let low = self.read32(offset);
        if low & BAR_TYPE_MASK == BAR_TYPE_64BIT {
            let high = self.read32(offset + 4);
            (((high as u64) << 32) | low as u64) & BAR_ADDR_MASK
        } else {
            low as u64 & BAR_ADDR_MASK
        }
    }

    /// Set bus-master and memory-space enable.
    pub fn enable_mastering(&self) {
        let cmd = read16(self.bus, self.slot, self.func, COMMAND_OFFSET);
        write16(self.bus, self.slot, self.func, COMMAND_OFFSET, cmd | 0x6);
    }

    /// Walk the capability list for `cap_id`.
    fn find_capability(&self, cap_id: u8) -> Option<u8> {
        let status = read16(self.bus, self.slot, self.func, STATUS_OFFSET);
        if status & STATUS_CAP_LIST == 0 {
            return None;
        }
        let mut ptr = read8(self.bus, self.slot, self.func, CAP_PTR_OFFSET) & !0x3;
        while ptr != 0 {
            if read8(self.bus, self.slot, self.func, ptr) == cap_id {
                return Some(ptr);
            }
            ptr = read8(self.bus, self.slot, self.func, ptr + 1) & !0x3;
        }
        None
    }

    /// Program a single-message MSI aimed at `dest_lapic` with `vector`.
    pub fn enable_msi(&self, vector: u8, dest_lapic: u8) -> Result<(), ()> {
        let cap = self.find_capability(CAP_MSI).ok_or(())?;
        let ctrl = read16(self.bus, self.slot, self.func, cap + 2);

        let addr = MSI_ADDR_BASE | ((dest_lapic as u32) << 12);
        self.write32(cap + 4, addr);

        let data_offset = if ctrl & MSI_CTRL_64BIT != 0 {
            self.write32(cap + 8, 0);
            cap + 12
        } else {
            cap + 8
        };
        write16(self.bus, self.slot, self.func, data_offset, vector as u16);

        let ctrl = (ctrl & !MSI_CTRL_MME_MASK) | MSI_CTRL_ENABLE;
        write16(self.bus, self.slot, self.func, cap + 2, ctrl);
        Ok(())
    }
}

static DEVICES: RwLock<Vec<PciDevice>> = RwLock::new(Vec::new());

fn scan_function(bus: u8, slot: u8, func: u8, next_bus: &mut u8) {
    let id = read32(bus, slot, func, 0);
    if id as u16 == 0xFFFF {
        return;
    }

    let class_reg = read32(bus, slot, func, 0x08);
    let header_type = read8(bus, slot, func, HEADER_TYPE_OFFSET);
    let dev = PciDevice {
        bus,
        slot,
        func,
        vendor_id: id as u16,
        device_id: (id >> 16) as u16,
        class: (class_reg >> 24) as u8,
        subclass: (class_reg >> 16) as u8,
        prog_if: (class_reg >> 8) as u8,
        int_line: read8(bus, slot, func, INT_LINE_OFFSET),
    };
    log::debug!(
        target: "pci",
        "{:02x}:{:02x}.{} vendor={:04x} device={:04x} class={:02x}:{:02x}",
        bus, slot, func, dev.vendor_id, dev.device_id, dev.class, dev.subclass
    );
    DEVICES.write().push(dev);

    // Descend into PCI-to-PCI bridges with a freshly assigned bus.
    if header_type & 0x7F == 0x01 {
        let secondary = *next_bus;
        *next_bus += 1;
        let mut buses = read32(bus, slot, func, 0x18);
        buses = (buses & 0xFF00_0000)
            | ((secondary as u32) << 16) // subordinate, widened below
            | ((secondary as u32) << 8)
            | bus as u32;
        write32(bus, slot, func, 0x18, buses);

        scan_bus(secondary, next_bus);

        let subordinate = *next_bus - 1;
        let buses = (read32(bus, slot, func, 0x18) & 0xFF00_FFFF)
            | ((subordinate as u32) << 16);
        write32(bus, slot, func, 0x18, buses);
    }
}

fn scan_bus(bus: u8, next_bus: &mut u8) {
    for slot in 0..32 {
        if read16(bus, slot, 0, 0) == 0xFFFF {
            continue;
        }
        scan_function(bus, slot, 0, next_bus);
        if read8(bus, slot, 0, HEADER_TYPE_OFFSET) & 0x80 != 0 {
            for func in 1..8 {
                scan_function(bus, slot, func, next_bus);
            }
        }
    }
}

/// Enumerate every device reachable from bus 0.
pub fn scan() {
    let mut next_bus = 1u8;
    scan_bus(0, &mut next_bus);
    log::info!(target: "pci", "{} device(s)", DEVICES.read().len());
}

/// First device matching (class, subclass).
pub fn find_class(class: u8, subclass: u8) -> Option<PciDevice> {
    DEVICES
        .read()
        .iter()
        .copied()
        .find(|d| d.class == class && d.subclass == subclass)
}
