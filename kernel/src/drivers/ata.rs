//! Polled ATA (legacy IDE ports).
//!
//! PIO LBA48 transfers on the primary and secondary channels, master
//! drive only. The submit path polls the status register and completes
//! the request inline, so the block core's halt-loop falls through
//! immediately. The IRQ handler only acknowledges the controller; the
//! data has already moved by then.

use x86_64::instructions::port::Port;

use crate::block::{self, BlockDevice, BlockDriver, BlockRequest};
use crate::error::KernelError;

// Register offsets from the channel base.
const REG_DATA: u16 = 0x00;
const REG_ERROR: u16 = 0x01;
const REG_SECCOUNT: u16 = 0x02;
const REG_LBA0: u16 = 0x03;
const REG_LBA1: u16 = 0x04;
const REG_LBA2: u16 = 0x05;
const REG_DRIVE: u16 = 0x06;
const REG_COMMAND: u16 = 0x07;
const REG_STATUS: u16 = 0x07;

const SR_BSY: u8 = 0x80;
const SR_DRDY: u8 = 0x40;
const SR_DRQ: u8 = 0x08;
const SR_ERR: u8 = 0x01;

const CMD_READ_PIO_EXT: u8 = 0x24;
const CMD_WRITE_PIO_EXT: u8 = 0x34;
const CMD_IDENTIFY: u8 = 0xEC;

const CHANNELS: [(u16, u16); 2] = [(0x1F0, 0x3F6), (0x170, 0x376)];

struct AtaChannel {
    base: u16,
    #[allow(dead_code)]
    ctrl: u16,
    sector_size: u32,
}

impl AtaChannel {
    fn status(&self) -> u8 {
        // SAFETY: status register of a probed channel.
        unsafe { Port::<u8>::new(self.base + REG_STATUS).read() }
    }

    fn write_reg(&self, reg: u16, val: u8) {
        // SAFETY: register writes on a probed channel.
        unsafe { Port::<u8>::new(self.base + reg).write(val) }
    }

    /// Wait until BSY clears; returns the final status.
    fn wait_not_busy(&self) -> u8 {
        loop {
            let st = self.status();
            if st & SR_BSY == 0 {
                return st;
            }
            core::hint::spin_loop();
        }
    }

    /// Wait for DRQ (data ready) after a command; Err on device error.
    fn wait_drq(&self) -> Result<(), ()> {
        loop {
            let st = self.status();
            if st & SR_ERR != 0 {
                return Err(());
            }
            if st & SR_BSY == 0 && st & SR_DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
    }

    fn select_lba48(&self, lba: u64, count: u16) {
        self.write_reg(REG_DRIVE, 0x40); // master, LBA mode
        self.write_reg(REG_SECCOUNT, (count >> 8) as u8);
        self.write_reg(REG_LBA0, (lba >> 24) as u8);
        self.write_reg(REG_LBA1, (lba >> 32) as u8);
        self.write_reg(REG_LBA2, (lba >> 40) as u8);
        self.write_reg(REG_SECCOUNT, count as u8);
        self.write_reg(REG_LBA0, lba as u8);
        self.write_reg(REG_LBA1, (lba >> 8) as u8);
        self.write_reg(REG_LBA2, (lba >> 16) as u8);
    }

    fn transfer_sector(&self, buf: *mut u8, words: usize, write: bool) {
        let mut data = Port::<u16>::new(self.base + REG_DATA);
        for w in 0..words {
            // SAFETY: the request buffer spans the whole transfer; the
            // data port moves one word per access.
            unsafe {
                let slot = (buf as *mut u16).add(w);
                if write {
                    data.write(core::ptr::read_unaligned(slot));
                } else {
                    core::ptr::write_unaligned(slot, data.read());
                }
            }
        }
    }
}

impl BlockDriver for AtaChannel {
    fn submit(&self, dev: &BlockDevice, req: &BlockRequest) -> Result<(), KernelError> {
        if req.count == 0 || req.count > u16::MAX as u32 {
            return Err(KernelError::Io);
        }
        self.wait_not_busy();
        self.select_lba48(req.lba, req.count as u16);
        self.write_reg(
            REG_COMMAND,
            if req.write {
                CMD_WRITE_PIO_EXT
            } else {
                CMD_READ_PIO_EXT
            },
        );

        let words = self.sector_size as usize / 2;
        for sector in 0..req.count as usize {
            if self.wait_drq().is_err() {
                dev.complete(-5); // task-file error
                return Ok(());
            }
            let at = req.buf.wrapping_add(sector * self.sector_size as usize);
            self.transfer_sector(at, words, req.write);
        }
        self.wait_not_busy();
        dev.complete(0);
        Ok(())
    }
}

/// Acknowledge a channel interrupt; polled transfers have already
/// consumed the data.
pub fn irq_handler(channel: usize) {
    if let Some((base, _)) = CHANNELS.get(channel) {
        // SAFETY: reading the status register clears the IRQ condition.
        unsafe {
            Port::<u8>::new(base + REG_STATUS).read();
        }
    }
}

/// Pull the logical sector size out of IDENTIFY data, honoring the
/// word-106 "logical sector longer than 512 bytes" indicator and the
/// word 117-118 size field.
fn sector_size_from_identify(id: &[u16; 256]) -> u32 {
    let w106 = id[106];
    // Valid when bit 14 is set and bit 15 is clear.
    if w106 & 0xC000 == 0x4000 && w106 & (1 << 12) != 0 {
        let words = (id[117] as u32) | ((id[118] as u32) << 16);
        if words >= 256 {
            return words * 2;
        }
    }
    512
}

fn identify(channel: &AtaChannel, drive_sel: u8) -> Option<[u16; 256]> {
    channel.write_reg(REG_DRIVE, drive_sel);
    channel.write_reg(REG_SECCOUNT, 0);
    channel.write_reg(REG_LBA0, 0);
    channel.write_reg(REG_LBA1, 0);
    channel.write_reg(REG_LBA2, 0);
    channel.write_reg(REG_COMMAND, CMD_IDENTIFY);

    if channel.status() == 0 {
        return None; // no drive
    }
    channel.wait_not_busy();
    // ATAPI and friends raise ERR or set signature bytes; only plain
    // ATA answers IDENTIFY with DRQ.
    if channel.wait_drq().is_err() {
        return None;
    }

    let mut id = [0u16; 256];
    let mut data = Port::<u16>::new(channel.base + REG_DATA);
    for word in id.iter_mut() {
        // SAFETY: IDENTIFY returns exactly 256 data words.
        *word = unsafe { data.read() };
    }
    Some(id)
}

/// Probe both channels (master drives) and register the block devices.
pub fn init() {
    for (index, &(base, ctrl)) in CHANNELS.iter().enumerate() {
        let mut channel = AtaChannel {
            base,
            ctrl,
            sector_size: 512,
        };
        let Some(id) = identify(&channel, 0xA0) else {
            continue;
        };
        // LBA48 support lives in word 83 bit 10.
        if id[83] & (1 << 10) == 0 {
            log::warn!(target: "ata", "ata{}: no LBA48, skipping", index);
            continue;
        }
        channel.sector_size = sector_size_from_identify(&id);
        let sectors = (id[100] as u64)
            | ((id[101] as u64) << 16)
            | ((id[102] as u64) << 32)
            | ((id[103] as u64) << 48);

        let sector_size = channel.sector_size;
        let driver: &'static AtaChannel = alloc::boxed::Box::leak(alloc::boxed::Box::new(channel));
        let name = alloc::format!("ata{}", index);
        match block::register(&name, sector_size, driver) {
            Ok(dev) => {
                let _ = crate::fs::devfs::register_block_device(dev);
                log::info!(
                    target: "ata",
                    "{}: {} sectors of {} bytes",
                    name, sectors, sector_size
                );
            }
            Err(e) => log::error!(target: "ata", "{}: register failed: {}", name, e),
        }
    }
}
