//! 4-level page table management.
//!
//! The upper half of every top-level table (entries 256..512) is the
//! kernel half, bitwise-shared across all address spaces; the lower half
//! is per-process. User address spaces are created by copying the kernel
//! half from the bootstrap table, deep-copied on fork (no sharing, no
//! copy-on-write) and torn down leaf-by-leaf on reap.
//!
//! TLB invalidation is local only; this kernel runs a single active CPU.

use core::ptr;

use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::PhysAddr;

use super::{phys_to_virt, virt_to_phys, FRAME_ALLOCATOR, PAGE_SIZE};
use crate::error::KernelError;

use core::sync::atomic::{AtomicU64, Ordering};

/// First kernel-half index in a top-level table.
const KERNEL_HALF: usize = 256;

/// Physical address of the bootstrap PML4 whose kernel half seeds every
/// user address space. Set once during boot (or by the test harness).
static KERNEL_PML4_PHYS: AtomicU64 = AtomicU64::new(0);

pub fn set_kernel_pml4(phys: u64) {
    KERNEL_PML4_PHYS.store(phys, Ordering::Release);
}

pub fn kernel_pml4_phys() -> u64 {
    KERNEL_PML4_PHYS.load(Ordering::Acquire)
}

/// Borrow the page table at a physical frame through the direct map.
///
/// # Safety
/// `phys` must be a live page-table frame owned by the caller's tree;
/// the caller must not hold another reference to the same table.
unsafe fn table_at<'a>(phys: u64) -> &'a mut PageTable {
    // SAFETY: per the function contract.
    unsafe { &mut *(phys_to_virt(phys) as *mut PageTable) }
}

/// Allocate a zeroed page-table frame; returns its physical address.
fn alloc_table_frame() -> Result<u64, KernelError> {
    let page = FRAME_ALLOCATOR
        .alloc_pages(1)
        .ok_or(KernelError::OutOfMemory)?;
    // SAFETY: freshly allocated, exclusively owned.
    unsafe { ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
    Ok(virt_to_phys(page.as_ptr() as u64))
}

fn table_indices(va: u64) -> [usize; 4] {
    [
        ((va >> 39) & 0x1FF) as usize,
        ((va >> 30) & 0x1FF) as usize,
        ((va >> 21) & 0x1FF) as usize,
        ((va >> 12) & 0x1FF) as usize,
    ]
}

/// Write one leaf mapping into the tree rooted at `pml4_phys`, allocating
/// any missing intermediate level (zeroed, present + writable, plus the
/// user flag for user trees).
fn map_in_tree(
    pml4_phys: u64,
    va: u64,
    pa: u64,
    flags: PageTableFlags,
    user_tree: bool,
) -> Result<(), KernelError> {
    let mut intermediate = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if user_tree {
        intermediate |= PageTableFlags::USER_ACCESSIBLE;
    }

    let idx = table_indices(va);
    let mut table_phys = pml4_phys;
    for &i in idx.iter().take(3) {
        // SAFETY: table_phys is a frame inside this tree.
        let table = unsafe { table_at(table_phys) };
        if !table[i].flags().contains(PageTableFlags::PRESENT) {
            let new_table = alloc_table_frame()?;
            table[i].set_addr(PhysAddr::new(new_table), intermediate);
        }
        table_phys = table[i].addr().as_u64();
    }

    // SAFETY: table_phys now names the leaf-level table.
    let leaf = unsafe { table_at(table_phys) };
    leaf[idx[3]].set_addr(PhysAddr::new(pa), flags | PageTableFlags::PRESENT);

    flush_if_active(pml4_phys, va);
    Ok(())
}

/// Walk the tree and return the physical address mapped at `va`.
fn translate_in_tree(pml4_phys: u64, va: u64) -> Option<u64> {
    let idx = table_indices(va);
    let mut table_phys = pml4_phys;
    for &i in idx.iter().take(3) {
        // SAFETY: table_phys is a frame inside this tree.
        let table = unsafe { table_at(table_phys) };
        if !table[i].flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        table_phys = table[i].addr().as_u64();
    }
    // SAFETY: leaf table of this tree.
    let leaf = unsafe { table_at(table_phys) };
    if !leaf[idx[3]].flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(leaf[idx[3]].addr().as_u64())
}

#[cfg(target_os = "none")]
fn flush_if_active(pml4_phys: u64, va: u64) {
    use x86_64::registers::control::Cr3;
    if Cr3::read().0.start_address().as_u64() == pml4_phys {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va));
    }
}

#[cfg(not(target_os = "none"))]
fn flush_if_active(_pml4_phys: u64, _va: u64) {}

/// A per-process address space owning its top-level table.
///
/// Dropping the space frees every user-half leaf frame, every user-half
/// intermediate table and the root; the kernel half is shared and never
/// freed from here.
pub struct AddressSpace {
    pml4_phys: u64,
}

impl AddressSpace {
    /// Fresh user address space: zeroed top level with the kernel half
    /// copied from the bootstrap table.
    pub fn new_user() -> Result<Self, KernelError> {
        let phys = alloc_table_frame()?;
        let kernel_phys = kernel_pml4_phys();
        // SAFETY: both frames are live page tables; disjoint.
        let (pml4, kernel) = unsafe { (table_at(phys), table_at(kernel_phys)) };
        for i in KERNEL_HALF..512 {
            pml4[i] = kernel[i].clone();
        }
        Ok(Self { pml4_phys: phys })
    }

    pub fn pml4_phys(&self) -> u64 {
        self.pml4_phys
    }

    /// Map one user page. Missing intermediates get the user flag.
    pub fn map_page(&mut self, va: u64, pa: u64, flags: PageTableFlags) -> Result<(), KernelError> {
        map_in_tree(self.pml4_phys, va, pa, flags, true)
    }

    /// Physical address backing `va`, if mapped.
    pub fn translate(&self, va: u64) -> Option<u64> {
        translate_in_tree(self.pml4_phys, va)
    }

    /// Deep-copy the user half of `src` into this space: for every
    /// present user-flagged leaf, a fresh frame with copied contents is
    /// mapped under the same flags. Frames are never shared.
    pub fn copy_user_from(&mut self, src: &AddressSpace) -> Result<(), KernelError> {
        // SAFETY: src's root is a live page table.
        let src_pml4 = unsafe { table_at(src.pml4_phys) };
        for i4 in 0..KERNEL_HALF {
            if !src_pml4[i4].flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            // SAFETY: present entries reference live tables of src's tree.
            let pdpt = unsafe { table_at(src_pml4[i4].addr().as_u64()) };
            for i3 in 0..512 {
                if !pdpt[i3].flags().contains(PageTableFlags::PRESENT) {
                    continue;
                }
                let pd = unsafe { table_at(pdpt[i3].addr().as_u64()) };
                for i2 in 0..512 {
                    if !pd[i2].flags().contains(PageTableFlags::PRESENT) {
                        continue;
                    }
                    let pt = unsafe { table_at(pd[i2].addr().as_u64()) };
                    for i1 in 0..512 {
                        let flags = pt[i1].flags();
                        if !flags.contains(PageTableFlags::PRESENT)
                            || !flags.contains(PageTableFlags::USER_ACCESSIBLE)
                        {
                            continue;
                        }
                        let va = ((i4 as u64) << 39)
                            | ((i3 as u64) << 30)
                            | ((i2 as u64) << 21)
                            | ((i1 as u64) << 12);

                        let page = FRAME_ALLOCATOR
                            .alloc_pages(1)
                            .ok_or(KernelError::OutOfMemory)?;
                        // SAFETY: copying one page from src's mapped frame
                        // (live, direct-mapped) into the fresh frame.
                        unsafe {
                            ptr::copy_nonoverlapping(
                                phys_to_virt(pt[i1].addr().as_u64()),
                                page.as_ptr(),
                                PAGE_SIZE,
                            );
                        }
                        self.map_page(va, virt_to_phys(page.as_ptr() as u64), flags)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Free every user-half leaf frame and intermediate table page.
    /// The kernel half stays intact.
    fn free_user_half(&mut self) {
        // SAFETY: this space owns its tree; reap runs with the space
        // inactive (never the current CR3).
        let pml4 = unsafe { table_at(self.pml4_phys) };
        for i4 in 0..KERNEL_HALF {
            if !pml4[i4].flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            let pdpt_phys = pml4[i4].addr().as_u64();
            let pdpt = unsafe { table_at(pdpt_phys) };
            for i3 in 0..512 {
                if !pdpt[i3].flags().contains(PageTableFlags::PRESENT) {
                    continue;
                }
                let pd_phys = pdpt[i3].addr().as_u64();
                let pd = unsafe { table_at(pd_phys) };
                for i2 in 0..512 {
                    if !pd[i2].flags().contains(PageTableFlags::PRESENT) {
                        continue;
                    }
                    let pt_phys = pd[i2].addr().as_u64();
                    let pt = unsafe { table_at(pt_phys) };
                    for i1 in 0..512 {
                        let flags = pt[i1].flags();
                        if flags.contains(PageTableFlags::PRESENT)
                            && flags.contains(PageTableFlags::USER_ACCESSIBLE)
                        {
                            free_frame(pt[i1].addr().as_u64());
                        }
                    }
                    free_frame(pt_phys);
                }
                free_frame(pd_phys);
            }
            free_frame(pdpt_phys);
            pml4[i4].set_unused();
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.free_user_half();
        free_frame(self.pml4_phys);
    }
}

fn free_frame(phys: u64) {
    if let Some(ptr) = core::ptr::NonNull::new(phys_to_virt(phys)) {
        FRAME_ALLOCATOR.free_pages(ptr, 1);
    }
}

/// Map one page into the currently active (kernel) tree.
#[cfg(target_os = "none")]
pub fn map_kernel_page(va: u64, pa: u64, flags: PageTableFlags) -> Result<(), KernelError> {
    use x86_64::registers::control::Cr3;
    map_in_tree(Cr3::read().0.start_address().as_u64(), va, pa, flags, false)
}

/// Map an MMIO region into the direct-map window: page-rounded,
/// cache-disable + write-through.
#[cfg(target_os = "none")]
pub fn map_mmio(phys: u64, size: u64) -> Result<(), KernelError> {
    let start = super::page_align_down(phys);
    let end = super::page_align_up(phys + size);
    for p in (start..end).step_by(PAGE_SIZE) {
        map_kernel_page(
            phys_to_virt(p) as u64,
            p,
            PageTableFlags::PRESENT
                | PageTableFlags::WRITABLE
                | PageTableFlags::NO_CACHE
                | PageTableFlags::WRITE_THROUGH,
        )?;
    }
    Ok(())
}

/// Load this address space's root into CR3.
#[cfg(target_os = "none")]
pub fn activate(space: &AddressSpace) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    // SAFETY: the root is a valid PML4 whose kernel half mirrors the
    // bootstrap table, so kernel code and stacks stay mapped.
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(space.pml4_phys)),
            Cr3Flags::empty(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Once;

    /// All paging tests share the global frame allocator; serialize them
    /// so the frame-count assertions stay deterministic.
    fn lock_tests() -> std::sync::MutexGuard<'static, ()> {
        static GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());
        GATE.lock().unwrap()
    }

    /// Seed the global frame allocator once with a leaked region and
    /// install a zeroed kernel template table.
    fn setup() {
        static POOL: Once<()> = Once::new();
        POOL.call_once(|| {
            let pages = 4096; // 16 MiB
            let layout =
                std::alloc::Layout::from_size_align(pages * PAGE_SIZE, 4 * 1024 * 1024).unwrap();
            let base = unsafe { std::alloc::alloc(layout) };
            assert!(!base.is_null());
            FRAME_ALLOCATOR.free_range(base as u64, base as u64 + (pages * PAGE_SIZE) as u64);
            FRAME_ALLOCATOR.enable_locking();

            let template = alloc_table_frame().unwrap();
            set_kernel_pml4(template);
        });
    }

    fn user_flags() -> PageTableFlags {
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
    }

    fn alloc_user_frame(fill: u8) -> u64 {
        let page = FRAME_ALLOCATOR.alloc_pages(1).unwrap();
        unsafe { core::ptr::write_bytes(page.as_ptr(), fill, PAGE_SIZE) };
        virt_to_phys(page.as_ptr() as u64)
    }

    fn read_byte(space: &AddressSpace, va: u64) -> u8 {
        let pa = space.translate(va & !0xFFF).unwrap();
        unsafe { *phys_to_virt(pa + (va & 0xFFF)) }
    }

    fn write_byte(space: &AddressSpace, va: u64, val: u8) {
        let pa = space.translate(va & !0xFFF).unwrap();
        unsafe { *phys_to_virt(pa + (va & 0xFFF)) = val };
    }

    #[test]
    fn map_and_translate() {
        let _gate = lock_tests();
        setup();
        let mut space = AddressSpace::new_user().unwrap();
        let frame = alloc_user_frame(0xAB);
        space.map_page(0x40000000, frame, user_flags()).unwrap();
        assert_eq!(space.translate(0x40000000), Some(frame));
        assert_eq!(space.translate(0x40001000), None);
        assert_eq!(read_byte(&space, 0x40000123), 0xAB);
    }

    #[test]
    fn kernel_half_is_shared_bitwise() {
        let _gate = lock_tests();
        setup();
        let a = AddressSpace::new_user().unwrap();
        let b = AddressSpace::new_user().unwrap();
        let raw = |phys: u64| unsafe {
            core::slice::from_raw_parts(phys_to_virt(phys) as *const u64, 512)
        };
        let (ta, tb, tk) = (raw(a.pml4_phys), raw(b.pml4_phys), raw(kernel_pml4_phys()));
        assert_eq!(&ta[KERNEL_HALF..], &tk[KERNEL_HALF..]);
        assert_eq!(&tb[KERNEL_HALF..], &tk[KERNEL_HALF..]);
    }

    #[test]
    fn deep_copy_reads_equal_then_diverges() {
        let _gate = lock_tests();
        setup();
        let mut parent = AddressSpace::new_user().unwrap();
        for (i, fill) in [(0u64, 0x11u8), (1, 0x22), (5, 0x33)] {
            let frame = alloc_user_frame(fill);
            parent
                .map_page(0x40000000 + i * PAGE_SIZE as u64, frame, user_flags())
                .unwrap();
        }

        let mut child = AddressSpace::new_user().unwrap();
        child.copy_user_from(&parent).unwrap();

        // Reads are identical immediately after the copy.
        for (i, fill) in [(0u64, 0x11u8), (1, 0x22), (5, 0x33)] {
            let va = 0x40000000 + i * PAGE_SIZE as u64;
            assert_eq!(read_byte(&child, va), fill);
            // ...but no leaf frame is shared.
            assert_ne!(child.translate(va), parent.translate(va));
        }

        // A write on either side is invisible to the other.
        write_byte(&child, 0x40000000, 0x99);
        assert_eq!(read_byte(&parent, 0x40000000), 0x11);
        write_byte(&parent, 0x40001000, 0x77);
        assert_eq!(read_byte(&child, 0x40001000), 0x22);
    }

    #[test]
    fn teardown_returns_frames() {
        let _gate = lock_tests();
        setup();
        let counts_before = FRAME_ALLOCATOR.free_block_counts();
        let free_before: usize = counts_before
            .iter()
            .enumerate()
            .map(|(o, c)| c << o)
            .sum();
        {
            let mut space = AddressSpace::new_user().unwrap();
            for i in 0..8u64 {
                let frame = alloc_user_frame(0);
                space
                    .map_page(0x40000000 + i * PAGE_SIZE as u64, frame, user_flags())
                    .unwrap();
            }
        }
        let free_after: usize = FRAME_ALLOCATOR
            .free_block_counts()
            .iter()
            .enumerate()
            .map(|(o, c)| c << o)
            .sum();
        assert_eq!(free_before, free_after);
    }
}
