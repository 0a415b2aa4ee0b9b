//! The process control block.

use alloc::string::String;
use alloc::sync::Arc;

use super::{KSTACK_SIZE, MAX_FDS};
use crate::arch::x86_64::context::Context;
use crate::arch::x86_64::idt::TrapFrame;
use crate::fs::File;
use crate::mm::paging::AddressSpace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Runnable,
    Running,
    Zombie,
}

/// One process-table slot.
///
/// `state`, `ppid` and `exit_code` transitions happen under the table
/// lock; the remaining fields are touched only by the owning process or
/// by its reaper after it became a zombie.
pub struct Process {
    pub pid: u32,
    pub ppid: u32,
    pub state: ProcState,
    pub exit_code: i32,
    pub space: Option<AddressSpace>,
    /// Kernel stack base; null while the slot is unused.
    pub kstack: *mut u8,
    /// Snapshot of the user-visible register state, kept in sync by
    /// creation, fork and exec.
    pub tf: TrapFrame,
    /// Saved callee-saved context, living on the kernel stack.
    pub context: *mut Context,
    /// Current heap break.
    pub brk: u64,
    pub name: String,
    pub files: [Option<Arc<File>>; MAX_FDS],
}

impl Process {
    pub const fn empty() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            state: ProcState::Unused,
            exit_code: 0,
            space: None,
            kstack: core::ptr::null_mut(),
            tf: TrapFrame::ZERO,
            context: core::ptr::null_mut(),
            brk: 0,
            name: String::new(),
            files: [const { None }; MAX_FDS],
        }
    }

    pub fn kstack_top(&self) -> u64 {
        self.kstack as u64 + KSTACK_SIZE as u64
    }

    /// Install `file` in the lowest free descriptor slot.
    pub fn fd_alloc(&mut self, file: Arc<File>) -> Option<usize> {
        for (fd, slot) in self.files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Some(fd);
            }
        }
        None
    }

    pub fn fd_get(&self, fd: usize) -> Option<Arc<File>> {
        self.files.get(fd)?.clone()
    }

    /// Close every open descriptor.
    pub fn close_fds(&mut self) {
        for slot in self.files.iter_mut() {
            *slot = None;
        }
    }

    /// Name the process after the last path component.
    pub fn set_name_from_path(&mut self, path: &str) {
        let base = path.rsplit('/').next().unwrap_or(path);
        self.name = String::from(&base[..base.len().min(15)]);
    }
}

/// The registers the syscall entry trampoline saved at the top of the
/// kernel stack, in ascending memory order from `kstack_top - 120`.
/// Must mirror the push sequence in `arch::x86_64::syscall`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SyscallSavedFrame {
    pub r9: u64,
    pub r8: u64,
    pub r10: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rflags: u64,
    pub rip: u64,
    pub user_rsp: u64,
}

impl Process {
    /// The in-flight syscall's saved register area on this process's
    /// kernel stack.
    ///
    /// # Safety
    /// Only meaningful while the process is executing a syscall whose
    /// entry trampoline ran on this kernel stack.
    pub unsafe fn syscall_saved(&self) -> &SyscallSavedFrame {
        let at = self.kstack_top() - core::mem::size_of::<SyscallSavedFrame>() as u64;
        // SAFETY: per the function contract; layout pinned by the
        // trampoline.
        unsafe { &*(at as *const SyscallSavedFrame) }
    }

    /// Redirect the pending sysret: the values restored on the way out
    /// of the current syscall become `rip`/`rsp`/`rflags`.
    ///
    /// # Safety
    /// Same constraint as [`syscall_saved`](Self::syscall_saved).
    pub unsafe fn patch_sysret(&mut self, rip: u64, rsp: u64, rflags: u64) {
        let top = self.kstack_top();
        // SAFETY: the three topmost save slots belong to the in-flight
        // syscall on this stack.
        unsafe {
            *((top - 8) as *mut u64) = rsp;
            *((top - 16) as *mut u64) = rip;
            *((top - 24) as *mut u64) = rflags;
        }
    }
}
