//! Kernel heap
//!
//! An 8 MiB region carved out of the buddy allocator backs the
//! `linked_list_allocator` global heap, which in turn backs all of
//! `alloc` (Arc, Vec, String, BTreeMap) in the kernel.

use super::{FRAME_ALLOCATOR, PAGE_SIZE};
use crate::error::KernelError;

/// 8 MiB: exactly one top-order buddy block.
pub const KERNEL_HEAP_PAGES: usize = 2048;

/// Carve the heap region out of the buddy allocator and hand it to the
/// global allocator. Must run after `free_range` has fed usable memory
/// in, and before the first `alloc` use.
pub fn init() -> Result<(), KernelError> {
    let region = FRAME_ALLOCATOR
        .alloc_pages(KERNEL_HEAP_PAGES)
        .ok_or(KernelError::OutOfMemory)?;
    // SAFETY: the region is exclusively ours and stays allocated for the
    // lifetime of the kernel.
    unsafe {
        crate::kernel_heap()
            .lock()
            .init(region.as_ptr(), KERNEL_HEAP_PAGES * PAGE_SIZE);
    }
    log::info!(target: "mem", "heap: {} KB at {:p}", KERNEL_HEAP_PAGES * PAGE_SIZE / 1024, region);
    Ok(())
}
