//! Process creation from an ELF path, and exec.

use alloc::string::String;
use alloc::vec::Vec;

use x86_64::structures::paging::PageTableFlags;

use super::pcb::{ProcState, Process};
use super::table::{forkret, TABLE};
use super::{elf, stack, USER_HEAP_BASE, USER_STACK_BASE, USER_STACK_TOP};
use crate::arch::x86_64::context::Context;
use crate::arch::x86_64::idt::{trapret, TrapFrame};
use crate::arch::x86_64::gdt;
use crate::error::KernelError;
use crate::fs::{vfs, OpenFlags};
use crate::mm::paging::AddressSpace;
use crate::mm::{phys_to_virt, virt_to_phys, FRAME_ALLOCATOR, PAGE_SIZE};

/// RFLAGS for user entry: interrupts on.
const USER_RFLAGS: u64 = 0x202;

/// A zeroed trap frame aimed at user mode.
pub fn user_trap_frame(entry: u64, user_rsp: u64) -> TrapFrame {
    let sel = gdt::selectors();
    TrapFrame {
        rip: entry,
        rsp: user_rsp,
        rflags: USER_RFLAGS,
        cs: sel.user_code.0 as u64,
        ss: sel.user_data.0 as u64,
        ..TrapFrame::ZERO
    }
}

/// Prepare a kernel stack so the scheduler's first switch runs
/// `forkret` and then "returns" through `trapret` into the given frame.
pub fn kstack_setup(p: &mut Process, tf: &TrapFrame) {
    let top = p.kstack_top();
    // SAFETY: the stack is exclusively owned by this embryo process;
    // the layout written here is what trapret and swtch expect.
    unsafe {
        let tf_at = (top - core::mem::size_of::<TrapFrame>() as u64) as *mut TrapFrame;
        tf_at.write(*tf);

        let ra_at = (tf_at as u64 - 8) as *mut u64;
        ra_at.write(trapret as usize as u64);

        let ctx_at = (ra_at as u64 - core::mem::size_of::<Context>() as u64) as *mut Context;
        ctx_at.write(Context {
            rip: forkret as usize as u64,
            ..Context::default()
        });
        p.context = ctx_at;
    }
    p.tf = *tf;
}

/// Allocate, zero, fill and map every page of the PT_LOAD segments,
/// then the user stack pages. Returns the entry point.
fn load_image(space: &mut AddressSpace, bytes: &[u8]) -> Result<u64, KernelError> {
    let image = elf::parse(bytes)?;

    for seg in &image.segments {
        let va_start = seg.vaddr & !(PAGE_SIZE as u64 - 1);
        let va_end = (seg.vaddr + seg.memsz + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if seg.writable() {
            flags |= PageTableFlags::WRITABLE;
        }

        let mut va = va_start;
        while va < va_end {
            let page = FRAME_ALLOCATOR
                .alloc_pages(1)
                .ok_or(KernelError::OutOfMemory)?;
            // SAFETY: fresh frame, exclusively ours until mapped.
            unsafe { core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };

            // Copy the overlap between this page and the file image.
            let file_start = seg.vaddr;
            let file_end = seg.vaddr + seg.filesz;
            if va + PAGE_SIZE as u64 > file_start && va < file_end {
                let copy_start = va.max(file_start);
                let copy_end = (va + PAGE_SIZE as u64).min(file_end);
                let src = seg.offset + (copy_start - file_start);
                let dst = (copy_start - va) as usize;
                // SAFETY: bounds were validated by elf::parse.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        bytes.as_ptr().add(src as usize),
                        page.as_ptr().add(dst),
                        (copy_end - copy_start) as usize,
                    );
                }
            }

            if let Err(e) = space.map_page(va, virt_to_phys(page.as_ptr() as u64), flags) {
                FRAME_ALLOCATOR.free_pages(page, 1);
                return Err(e);
            }
            va += PAGE_SIZE as u64;
        }
    }

    // User stack pages, just below USER_STACK_TOP.
    let mut va = USER_STACK_BASE;
    while va < USER_STACK_TOP + PAGE_SIZE as u64 {
        let page = FRAME_ALLOCATOR
            .alloc_pages(1)
            .ok_or(KernelError::OutOfMemory)?;
        // SAFETY: fresh frame.
        unsafe { core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
        let flags =
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        if let Err(e) = space.map_page(va, virt_to_phys(page.as_ptr() as u64), flags) {
            FRAME_ALLOCATOR.free_pages(page, 1);
            return Err(e);
        }
        va += PAGE_SIZE as u64;
    }

    Ok(image.entry)
}

/// Open fds 0/1/2 against /dev/null and /dev/cons when available;
/// missing devices are silently tolerated.
fn init_std_fds(p: &mut Process) {
    if let Ok(null) = vfs().open("/dev/null", OpenFlags::RDONLY, 0) {
        p.files[0] = Some(null);
    }
    if let Ok(cons) = vfs().open("/dev/cons", OpenFlags::WRONLY, 0) {
        p.files[1] = Some(cons.clone());
        p.files[2] = Some(cons); // stderr shares the handle
    }
}

/// Create a runnable process from the ELF at `path`.
pub fn create(path: &str) -> Result<u32, KernelError> {
    let image = vfs().read_to_vec(path).map_err(KernelError::Fs)?;

    let p = TABLE.alloc().ok_or(KernelError::ProcessTableFull)?;

    let mut space = match AddressSpace::new_user() {
        Ok(space) => space,
        Err(e) => {
            TABLE.discard(p);
            return Err(e);
        }
    };
    let entry = match load_image(&mut space, &image) {
        Ok(entry) => entry,
        Err(e) => {
            drop(space);
            TABLE.discard(p);
            return Err(e);
        }
    };

    kstack_setup(p, &user_trap_frame(entry, USER_STACK_TOP));
    p.space = Some(space);
    p.brk = USER_HEAP_BASE;
    p.ppid = 0;
    p.set_name_from_path(path);
    init_std_fds(p);

    TABLE.lock.acquire_raw();
    p.state = ProcState::Runnable;
    TABLE.lock.release_raw();

    log::info!(target: "proc", "pid {} '{}' entry={:#x}", p.pid, p.name, entry);
    Ok(p.pid)
}

/// Replace the current process image. The new address space is fully
/// built before the old one is touched, so a failure leaves the caller
/// intact. On success the pending sysret is redirected to the new
/// entry point and this returns normally.
pub fn exec(path: &str, argv: &[String]) -> Result<(), KernelError> {
    let p = super::table::current().ok_or(KernelError::NoProcess)?;

    let image = vfs().read_to_vec(path).map_err(KernelError::Fs)?;
    let mut space = AddressSpace::new_user()?;
    let entry = load_image(&mut space, &image)?;

    // argc/argv onto the new stack page, reached through the direct map.
    let stack_phys = space
        .translate(USER_STACK_BASE)
        .ok_or(KernelError::BadExecutable)?;
    // SAFETY: the freshly mapped stack frame is exclusively ours.
    let stack_page =
        unsafe { core::slice::from_raw_parts_mut(phys_to_virt(stack_phys), PAGE_SIZE) };
    let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    let user_rsp = stack::build_argv_stack(stack_page, USER_STACK_BASE, &argv_refs)
        .ok_or(KernelError::BadExecutable)?;

    p.brk = USER_HEAP_BASE;

    // Redirect the in-flight syscall's return into the new image.
    // SAFETY: exec runs inside that syscall, on this kernel stack.
    unsafe {
        p.patch_sysret(entry, user_rsp, USER_RFLAGS);
    }
    p.tf = user_trap_frame(entry, user_rsp);

    // Switch to the new space before releasing the old one's frames.
    let old = p.space.replace(space);
    if let Some(space) = p.space.as_ref() {
        crate::mm::paging::activate(space);
    }
    drop(old);

    p.set_name_from_path(path);
    log::debug!(target: "exec", "pid {} -> '{}' entry={:#x} rsp={:#x}", p.pid, p.name, entry, user_rsp);
    Ok(())
}
