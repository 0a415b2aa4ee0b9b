//! Memory management
//!
//! [`buddy`] owns every usable physical page and hands out aligned
//! power-of-two page runs. [`paging`] builds and mutates the 4-level page
//! table trees and the per-process address spaces on top of it.
//! All physical memory is reached through the higher-half direct map
//! supplied by the loader: `virt = phys + hhdm_offset`.

use core::sync::atomic::{AtomicU64, Ordering};

pub mod buddy;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod heap;
pub mod paging;

pub use buddy::{FrameAllocator, MAX_ORDER};

/// Size of a physical page frame.
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE).
pub const PAGE_SHIFT: usize = 12;

/// The global physical page allocator.
pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

/// Higher-half direct map offset, set once from the loader handshake.
/// Zero on the host, where "physical" addresses are plain heap pointers.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Kernel virtual address of a physical address, through the direct map.
pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (phys + hhdm_offset()) as *mut u8
}

/// Inverse of [`phys_to_virt`]; only valid for direct-map addresses.
pub fn virt_to_phys(virt: u64) -> u64 {
    virt - hhdm_offset()
}

/// Round `x` down to a page boundary.
pub const fn page_align_down(x: u64) -> u64 {
    x & !(PAGE_SIZE as u64 - 1)
}

/// Round `x` up to a page boundary.
pub const fn page_align_up(x: u64) -> u64 {
    (x + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}
