//! Block I/O core
//!
//! A driver-agnostic single-outstanding-request engine shared by the
//! polled ATA and IRQ-driven AHCI drivers. The synchronous read/write
//! primitive installs a stack-allocated request, invokes the driver's
//! submit hook, then halt-loops until completion. Completion — from an
//! IRQ handler or from a polling driver returning — writes `status`
//! before `done`, so a waiter observing `done` sees the status already
//! set.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};

use spin::RwLock;

use crate::error::KernelError;

/// Maximum number of registered block devices.
pub const MAX_DEVICES: usize = 8;

/// One in-flight unit. At most one request is outstanding per device.
pub struct BlockRequest {
    pub lba: u64,
    pub count: u32,
    pub buf: *mut u8,
    pub write: bool,
    done: AtomicBool,
    status: AtomicI32,
}

// SAFETY: the buffer pointer is only dereferenced by the driver while
// the request is the device's current request; the single-outstanding
// invariant serializes all access.
unsafe impl Send for BlockRequest {}
unsafe impl Sync for BlockRequest {}

impl BlockRequest {
    pub fn new(lba: u64, count: u32, buf: *mut u8, write: bool) -> Self {
        Self {
            lba,
            count,
            buf,
            write,
            done: AtomicBool::new(false),
            status: AtomicI32::new(0),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Driver-side submit hook. A submit-time failure (e.g. no free slot)
/// returns `Err` and must leave no I/O in flight; runtime errors are
/// reported through [`BlockDevice::complete`] with a negative status.
pub trait BlockDriver: Send + Sync {
    fn submit(&self, dev: &BlockDevice, req: &BlockRequest) -> Result<(), KernelError>;
}

pub struct BlockDevice {
    name: String,
    sector_size: u32,
    driver: &'static dyn BlockDriver,
    current: AtomicPtr<BlockRequest>,
}

impl BlockDevice {
    pub fn new(name: &str, sector_size: u32, driver: &'static dyn BlockDriver) -> Self {
        Self {
            name: String::from(name),
            sector_size,
            driver,
            current: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// The outstanding request, or null. Drivers use this from their IRQ
    /// handlers to find the transfer being completed.
    pub fn current_request(&self) -> *mut BlockRequest {
        self.current.load(Ordering::Acquire)
    }

    /// Submit one request and wait for its completion.
    pub fn submit_sync(
        &self,
        lba: u64,
        count: u32,
        buf: *mut u8,
        write: bool,
    ) -> Result<(), KernelError> {
        let req = BlockRequest::new(lba, count, buf, write);

        self.current
            .store(&req as *const _ as *mut _, Ordering::Release);

        if let Err(e) = self.driver.submit(self, &req) {
            self.current.store(core::ptr::null_mut(), Ordering::Release);
            return Err(e);
        }

        // Works for both interrupt-driven and polling drivers: a polling
        // driver has already completed by the time we get here.
        while !req.is_done() {
            wait_for_interrupt();
        }

        self.current.store(core::ptr::null_mut(), Ordering::Release);

        let status = req.status.load(Ordering::Relaxed);
        if status < 0 {
            return Err(KernelError::Io);
        }
        Ok(())
    }

    /// Called by the driver when the current request completes, from an
    /// ISR or from the polling path. Status is written before `done`.
    pub fn complete(&self, status: i32) {
        let req = self.current.load(Ordering::Acquire);
        if req.is_null() {
            return; // spurious
        }
        // SAFETY: the request outlives its tenure as current_request;
        // the submitter is still blocked in submit_sync.
        unsafe {
            (*req).status.store(status, Ordering::Relaxed);
            (*req).done.store(true, Ordering::Release);
        }
    }

    /// Read `count` sectors starting at `lba` into `buf`.
    pub fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), KernelError> {
        assert!(buf.len() >= count as usize * self.sector_size as usize);
        self.submit_sync(lba, count, buf.as_mut_ptr(), false)
    }

    /// Write `count` sectors starting at `lba` from `buf`.
    pub fn write(&self, lba: u64, count: u32, buf: &[u8]) -> Result<(), KernelError> {
        assert!(buf.len() >= count as usize * self.sector_size as usize);
        self.submit_sync(lba, count, buf.as_ptr() as *mut u8, true)
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn wait_for_interrupt() {
    // Halt with interrupts enabled so the completion IRQ can land.
    x86_64::instructions::interrupts::enable_and_hlt();
}

#[cfg(not(target_os = "none"))]
fn wait_for_interrupt() {
    core::hint::spin_loop();
}

static DEVICES: RwLock<Vec<&'static BlockDevice>> = RwLock::new(Vec::new());

/// Register a block device under its driver-assigned name.
pub fn register(
    name: &str,
    sector_size: u32,
    driver: &'static dyn BlockDriver,
) -> Result<&'static BlockDevice, KernelError> {
    let mut devices = DEVICES.write();
    if devices.len() >= MAX_DEVICES {
        log::error!(target: "blk", "device table full");
        return Err(KernelError::DeviceTableFull);
    }
    let dev: &'static BlockDevice =
        alloc::boxed::Box::leak(alloc::boxed::Box::new(BlockDevice::new(
            name,
            sector_size,
            driver,
        )));
    devices.push(dev);
    log::info!(target: "blk", "registered {} ({}B sectors)", name, sector_size);
    Ok(dev)
}

/// Find a registered device by name.
pub fn get(name: &str) -> Option<&'static BlockDevice> {
    DEVICES.read().iter().copied().find(|d| d.name() == name)
}

/// Snapshot of all registered devices.
pub fn all() -> Vec<&'static BlockDevice> {
    DEVICES.read().clone()
}

#[cfg(test)]
pub mod testutil {
    //! An in-memory disk driver for the unit suite; completes requests
    //! inline like a polling driver.

    use super::*;
    use alloc::boxed::Box;
    use spin::Mutex;

    pub struct MemDisk {
        pub sectors: Mutex<Vec<u8>>,
        pub sector_size: usize,
    }

    impl BlockDriver for MemDisk {
        fn submit(&self, dev: &BlockDevice, req: &BlockRequest) -> Result<(), KernelError> {
            let mut data = self.sectors.lock();
            let start = req.lba as usize * self.sector_size;
            let len = req.count as usize * self.sector_size;
            if start + len > data.len() {
                dev.complete(-5);
                return Ok(());
            }
            // SAFETY: the submitter guarantees `buf` spans `len` bytes
            // for the lifetime of the request.
            unsafe {
                if req.write {
                    core::ptr::copy_nonoverlapping(req.buf, data[start..].as_mut_ptr(), len);
                } else {
                    core::ptr::copy_nonoverlapping(data[start..].as_ptr(), req.buf, len);
                }
            }
            dev.complete(0);
            Ok(())
        }
    }

    /// Leak a memory-backed block device over `image`.
    pub fn mem_device(name: &str, sector_size: usize, image: Vec<u8>) -> &'static BlockDevice {
        let driver: &'static MemDisk = Box::leak(Box::new(MemDisk {
            sectors: Mutex::new(image),
            sector_size,
        }));
        Box::leak(Box::new(BlockDevice::new(
            name,
            sector_size as u32,
            driver,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::mem_device;
    use super::*;
    use alloc::vec;

    #[test]
    fn read_back_what_was_written() {
        let dev = mem_device("mem0", 512, vec![0u8; 512 * 8]);
        let pattern: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        dev.write(2, 2, &pattern).unwrap();

        let mut out = vec![0u8; 1024];
        dev.read(2, 2, &mut out).unwrap();
        assert_eq!(out, pattern);
    }

    #[test]
    fn out_of_range_surfaces_io_error() {
        let dev = mem_device("mem1", 512, vec![0u8; 512 * 4]);
        let mut buf = vec![0u8; 512];
        assert_eq!(dev.read(100, 1, &mut buf), Err(KernelError::Io));
    }

    #[test]
    fn no_request_outstanding_after_completion() {
        let dev = mem_device("mem2", 512, vec![0u8; 512 * 4]);
        let mut buf = vec![0u8; 512];
        dev.read(0, 1, &mut buf).unwrap();
        assert!(dev.current_request().is_null());
        dev.read(1, 1, &mut buf).unwrap();
        assert!(dev.current_request().is_null());
    }

    #[test]
    fn spurious_completion_is_ignored() {
        let dev = mem_device("mem3", 512, vec![0u8; 512]);
        // No current request; must not crash or wedge the device.
        dev.complete(-1);
        let mut buf = vec![0u8; 512];
        dev.read(0, 1, &mut buf).unwrap();
    }
}
