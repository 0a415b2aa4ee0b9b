//! System call numbering and dispatch.
//!
//! The dispatcher is reached from the fast-syscall entry trampoline
//! with the number in the first C argument. Every pointer argument is
//! validated against the upper user bound before it is dereferenced;
//! invalid pointers fail the call with -1 rather than faulting.

/// Pointer arguments must lie below the canonical user boundary.
pub const USER_PTR_MAX: u64 = 0x8000_0000_0000;

/// Longest path accepted from user space.
pub const PATH_MAX: usize = 4096;

/// Most argv entries exec will copy in.
pub const ARG_MAX: usize = 32;

/// The system call surface.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sysno {
    Exit = 0,
    Write = 1,
    Getpid = 2,
    Exec = 3,
    Fork = 4,
    Open = 5,
    Close = 6,
    Read = 7,
    Seek = 8,
    Fstat = 9,
    Stat = 10,
    Wait = 11,
    Dup = 12,
    Dup2 = 13,
    Brk = 14,
    Pipe = 15,
    Fbinfo = 16,
}

impl TryFrom<u64> for Sysno {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, ()> {
        Ok(match value {
            0 => Sysno::Exit,
            1 => Sysno::Write,
            2 => Sysno::Getpid,
            3 => Sysno::Exec,
            4 => Sysno::Fork,
            5 => Sysno::Open,
            6 => Sysno::Close,
            7 => Sysno::Read,
            8 => Sysno::Seek,
            9 => Sysno::Fstat,
            10 => Sysno::Stat,
            11 => Sysno::Wait,
            12 => Sysno::Dup,
            13 => Sysno::Dup2,
            14 => Sysno::Brk,
            15 => Sysno::Pipe,
            16 => Sysno::Fbinfo,
            _ => return Err(()),
        })
    }
}

/// Framebuffer geometry reported by `fbinfo`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbInfoOut {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub addr: u64,
    pub size: u64,
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod handlers {
    use alloc::string::String;
    use alloc::vec::Vec;

    use x86_64::structures::paging::PageTableFlags;

    use super::*;
    use crate::fs::{pipe, vfs, OpenFlags, Stat, Whence};
    use crate::mm::{virt_to_phys, FRAME_ALLOCATOR, PAGE_SIZE};
    use crate::process::table::current;
    use crate::process::{creation, exit, fork, wait, USER_HEAP_BASE, USER_HEAP_LIMIT};

    fn user_ptr_ok(ptr: u64, len: u64) -> bool {
        ptr != 0 && ptr.checked_add(len).is_some_and(|end| end <= USER_PTR_MAX)
    }

    /// Borrow user memory as a byte slice. The mapping is trusted to be
    /// present; a wild-but-canonical pointer faults in kernel mode and
    /// panics, matching the rest of this kernel's policy.
    ///
    /// # Safety
    /// Range must have been checked with `user_ptr_ok`.
    unsafe fn user_bytes_mut<'a>(ptr: u64, len: usize) -> &'a mut [u8] {
        // SAFETY: per the function contract.
        unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len) }
    }

    /// Copy in a NUL-terminated user string.
    fn user_cstr(ptr: u64) -> Option<String> {
        if !user_ptr_ok(ptr, 1) {
            return None;
        }
        let mut bytes = Vec::new();
        for i in 0..PATH_MAX as u64 {
            if !user_ptr_ok(ptr + i, 1) {
                return None;
            }
            // SAFETY: single mapped byte below the user bound.
            let b = unsafe { *((ptr + i) as *const u8) };
            if b == 0 {
                return String::from_utf8(bytes).ok();
            }
            bytes.push(b);
        }
        None
    }

    /// Copy a value out to user memory.
    fn copy_to_user<T: Copy>(ptr: u64, value: &T) -> bool {
        let len = core::mem::size_of::<T>() as u64;
        if !user_ptr_ok(ptr, len) {
            return false;
        }
        // SAFETY: range checked; T is plain data.
        unsafe { core::ptr::write_unaligned(ptr as *mut T, *value) };
        true
    }

    /// The handler called from the entry trampoline.
    #[no_mangle]
    pub extern "C" fn syscall_dispatch(
        num: u64,
        a1: u64,
        a2: u64,
        a3: u64,
        _a4: u64,
        _a5: u64,
    ) -> i64 {
        let Ok(sysno) = Sysno::try_from(num) else {
            return -1;
        };
        match sysno {
            Sysno::Exit => exit::exit(a1 as i32),
            Sysno::Write => sys_write(a1, a2, a3),
            Sysno::Getpid => current().map(|p| p.pid as i64).unwrap_or(-1),
            Sysno::Exec => sys_exec(a1, a2),
            Sysno::Fork => match fork::fork() {
                Ok(pid) => pid as i64,
                Err(_) => -1,
            },
            Sysno::Open => sys_open(a1, a2),
            Sysno::Close => sys_close(a1),
            Sysno::Read => sys_read(a1, a2, a3),
            Sysno::Seek => sys_seek(a1, a2 as i64, a3),
            Sysno::Fstat => sys_fstat(a1, a2),
            Sysno::Stat => sys_stat(a1, a2),
            Sysno::Wait => sys_wait(a1),
            Sysno::Dup => sys_dup(a1),
            Sysno::Dup2 => sys_dup2(a1, a2),
            Sysno::Brk => sys_brk(a1),
            Sysno::Pipe => sys_pipe(a1),
            Sysno::Fbinfo => sys_fbinfo(a1),
        }
    }

    fn sys_write(fd: u64, buf: u64, len: u64) -> i64 {
        if !user_ptr_ok(buf, len) {
            return -1;
        }
        // SAFETY: range checked against the user bound.
        let bytes = unsafe { user_bytes_mut(buf, len as usize) };

        let file = current().and_then(|p| p.fd_get(fd as usize));
        match file {
            Some(file) => match file.write(bytes) {
                Ok(n) => n as i64,
                Err(e) => e.code(),
            },
            // Fallback: direct console for stdout/stderr before any
            // file table exists.
            None if fd == 1 || fd == 2 => {
                if let Ok(s) = core::str::from_utf8(bytes) {
                    print!("{}", s);
                }
                len as i64
            }
            None => -1,
        }
    }

    fn sys_read(fd: u64, buf: u64, len: u64) -> i64 {
        if !user_ptr_ok(buf, len) {
            return -1;
        }
        let Some(file) = current().and_then(|p| p.fd_get(fd as usize)) else {
            return -1;
        };
        // SAFETY: range checked.
        let bytes = unsafe { user_bytes_mut(buf, len as usize) };
        match file.read(bytes) {
            Ok(n) => n as i64,
            Err(e) => e.code(),
        }
    }

    fn sys_open(path: u64, flags: u64) -> i64 {
        let Some(p) = current() else { return -1 };
        let Some(path) = user_cstr(path) else {
            return -1;
        };
        // The low two bits select the access mode.
        let mode = match flags & 3 {
            1 => OpenFlags::WRONLY,
            2 => OpenFlags::RDWR,
            _ => OpenFlags::RDONLY,
        };
        let Ok(file) = vfs().open(&path, mode, 0) else {
            return -1;
        };
        match p.fd_alloc(file) {
            Some(fd) => fd as i64,
            None => -1,
        }
    }

    fn sys_close(fd: u64) -> i64 {
        let Some(p) = current() else { return -1 };
        match p.files.get_mut(fd as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None; // dropping the reference closes the file
                0
            }
            _ => -1,
        }
    }

    fn sys_seek(fd: u64, off: i64, whence: u64) -> i64 {
        let Some(file) = current().and_then(|p| p.fd_get(fd as usize)) else {
            return -1;
        };
        let Ok(whence) = Whence::try_from(whence) else {
            return -1;
        };
        match file.seek(off, whence) {
            Ok(pos) => pos as i64,
            Err(e) => e.code(),
        }
    }

    fn sys_fstat(fd: u64, st_out: u64) -> i64 {
        let Some(file) = current().and_then(|p| p.fd_get(fd as usize)) else {
            return -1;
        };
        match file.stat() {
            Ok(st) => {
                if copy_to_user::<Stat>(st_out, &st) {
                    0
                } else {
                    -1
                }
            }
            Err(_) => -1,
        }
    }

    fn sys_stat(path: u64, st_out: u64) -> i64 {
        let Some(path) = user_cstr(path) else {
            return -1;
        };
        match vfs().stat(&path) {
            Ok(st) => {
                if copy_to_user::<Stat>(st_out, &st) {
                    0
                } else {
                    -1
                }
            }
            Err(_) => -1,
        }
    }

    fn sys_exec(path: u64, argv: u64) -> i64 {
        let Some(path) = user_cstr(path) else {
            return -1;
        };

        // Copy the argv vector in before the old image goes away.
        let mut args: Vec<String> = Vec::new();
        if argv != 0 {
            for i in 0..ARG_MAX as u64 {
                let slot = argv + i * 8;
                if !user_ptr_ok(slot, 8) {
                    return -1;
                }
                // SAFETY: checked user slot holding a pointer.
                let arg_ptr = unsafe { *(slot as *const u64) };
                if arg_ptr == 0 {
                    break;
                }
                let Some(arg) = user_cstr(arg_ptr) else {
                    return -1;
                };
                args.push(arg);
            }
        }

        match creation::exec(&path, &args) {
            Ok(()) => 0, // the patched sysret does the real transfer
            Err(_) => -1,
        }
    }

    fn sys_wait(status_out: u64) -> i64 {
        match wait::wait() {
            Ok((pid, status)) => {
                if status_out != 0 {
                    copy_to_user::<i32>(status_out, &status);
                }
                pid as i64
            }
            Err(_) => -1,
        }
    }

    fn sys_dup(fd: u64) -> i64 {
        let Some(p) = current() else { return -1 };
        let Some(file) = p.fd_get(fd as usize) else {
            return -1;
        };
        match p.fd_alloc(file) {
            Some(new_fd) => new_fd as i64,
            None => -1,
        }
    }

    fn sys_dup2(old_fd: u64, new_fd: u64) -> i64 {
        let Some(p) = current() else { return -1 };
        let Some(file) = p.fd_get(old_fd as usize) else {
            return -1;
        };
        let Some(slot) = p.files.get_mut(new_fd as usize) else {
            return -1;
        };
        if old_fd != new_fd {
            // Dropping the previous occupant closes it.
            *slot = Some(file);
        }
        new_fd as i64
    }

    /// Query (arg 0) or move the heap break. Growth maps zeroed
    /// writable user pages; shrinking only moves the break.
    fn sys_brk(new_brk: u64) -> i64 {
        let Some(p) = current() else { return -1 };
        if new_brk == 0 {
            return p.brk as i64;
        }
        if !(USER_HEAP_BASE..=USER_HEAP_LIMIT).contains(&new_brk) {
            return p.brk as i64;
        }

        let old_page = (p.brk + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let new_page = (new_brk + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);

        if new_brk > p.brk {
            let Some(space) = p.space.as_mut() else {
                return -1;
            };
            let mut va = old_page;
            while va < new_page {
                let Some(page) = FRAME_ALLOCATOR.alloc_pages(1) else {
                    return p.brk as i64; // out of memory: break unmoved
                };
                // SAFETY: fresh frame; user heap pages start zeroed.
                unsafe { core::ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
                let flags = PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::USER_ACCESSIBLE;
                if space
                    .map_page(va, virt_to_phys(page.as_ptr() as u64), flags)
                    .is_err()
                {
                    FRAME_ALLOCATOR.free_pages(page, 1);
                    return p.brk as i64;
                }
                va += PAGE_SIZE as u64;
            }
        }
        // Shrinking does not unmap.
        p.brk = new_brk;
        new_brk as i64
    }

    fn sys_pipe(fds_out: u64) -> i64 {
        let Some(p) = current() else { return -1 };
        if !user_ptr_ok(fds_out, 8) {
            return -1;
        }
        let Ok((read_end, write_end)) = pipe::create() else {
            return -1;
        };
        let Some(rfd) = p.fd_alloc(read_end) else {
            return -1;
        };
        let Some(wfd) = p.fd_alloc(write_end) else {
            p.files[rfd] = None;
            return -1;
        };
        let pair = [rfd as i32, wfd as i32];
        if !copy_to_user::<[i32; 2]>(fds_out, &pair) {
            p.files[rfd] = None;
            p.files[wfd] = None;
            return -1;
        }
        0
    }

    fn sys_fbinfo(out: u64) -> i64 {
        let Some(fb) = crate::drivers::fb::info() else {
            return -1;
        };
        let info = FbInfoOut {
            width: fb.width,
            height: fb.height,
            pitch: fb.pitch,
            bpp: fb.bpp,
            addr: fb.addr,
            size: fb.size,
        };
        if copy_to_user::<FbInfoOut>(out, &info) {
            0
        } else {
            -1
        }
    }

}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use handlers::syscall_dispatch;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_is_stable() {
        // The numeric surface is ABI; renumbering breaks userspace.
        for (n, sysno) in [
            (0u64, Sysno::Exit),
            (1, Sysno::Write),
            (2, Sysno::Getpid),
            (3, Sysno::Exec),
            (4, Sysno::Fork),
            (5, Sysno::Open),
            (6, Sysno::Close),
            (7, Sysno::Read),
            (8, Sysno::Seek),
            (9, Sysno::Fstat),
            (10, Sysno::Stat),
            (11, Sysno::Wait),
            (12, Sysno::Dup),
            (13, Sysno::Dup2),
            (14, Sysno::Brk),
            (15, Sysno::Pipe),
            (16, Sysno::Fbinfo),
        ] {
            assert_eq!(Sysno::try_from(n), Ok(sysno));
        }
        assert!(Sysno::try_from(17).is_err());
    }
}
