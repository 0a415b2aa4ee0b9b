//! Framebuffer record from the loader.
//!
//! The kernel does not draw; it only captures the geometry and mapped
//! address for the `fbinfo` syscall and exposes the raw pixel memory as
//! `/dev/fb` plus a read-only geometry report as `/dev/fbctl`.

use alloc::sync::Arc;

use spin::Once;

use crate::fs::{devfs, mode, File, FileOps, FsError, Whence};

#[derive(Debug, Clone, Copy)]
pub struct FbInfo {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    /// Kernel-virtual base of the mapped pixel memory.
    pub addr: u64,
    pub size: u64,
}

static FB: Once<FbInfo> = Once::new();

pub fn info() -> Option<FbInfo> {
    FB.get().copied()
}

/// Capture the loader-provided framebuffer and publish the device
/// nodes.
pub fn init(framebuffer: Option<&'static mut bootloader_api::info::FrameBuffer>) {
    let Some(framebuffer) = framebuffer else {
        log::warn!(target: "fb", "no framebuffer from loader");
        return;
    };
    let fb_info = framebuffer.info();
    let buffer = framebuffer.buffer_mut();
    FB.call_once(|| FbInfo {
        width: fb_info.width as u32,
        height: fb_info.height as u32,
        pitch: (fb_info.stride * fb_info.bytes_per_pixel) as u32,
        bpp: fb_info.bytes_per_pixel as u32 * 8,
        addr: buffer.as_mut_ptr() as u64,
        size: buffer.len() as u64,
    });

    let _ = devfs::register_node("fb", mode::S_IFCHR | 0o660, Arc::new(FbOps));
    let _ = devfs::register_node("fbctl", mode::S_IFCHR | 0o444, Arc::new(FbCtlOps));

    let fb = info().unwrap();
    log::info!(target: "fb", "{}x{} pitch={} bpp={}", fb.width, fb.height, fb.pitch, fb.bpp);
}

/// Raw byte-addressable framebuffer node.
struct FbOps;

impl FbOps {
    fn clamp(off: u64, want: usize, size: u64) -> usize {
        if off >= size {
            0
        } else {
            ((size - off) as usize).min(want)
        }
    }
}

impl FileOps for FbOps {
    fn read(&self, _file: &File, buf: &mut [u8], pos: &mut u64) -> crate::fs::Result<usize> {
        let fb = info().ok_or(FsError::Io)?;
        let n = Self::clamp(*pos, buf.len(), fb.size);
        // SAFETY: [addr, addr+size) is the loader-mapped pixel memory.
        unsafe {
            core::ptr::copy_nonoverlapping((fb.addr + *pos) as *const u8, buf.as_mut_ptr(), n);
        }
        *pos += n as u64;
        Ok(n)
    }

    fn write(&self, _file: &File, buf: &[u8], pos: &mut u64) -> crate::fs::Result<usize> {
        let fb = info().ok_or(FsError::Io)?;
        let n = Self::clamp(*pos, buf.len(), fb.size);
        // SAFETY: as above; writes paint pixels.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), (fb.addr + *pos) as *mut u8, n);
        }
        *pos += n as u64;
        Ok(n)
    }

    fn llseek(&self, _file: &File, pos: &mut u64, off: i64, whence: Whence) -> crate::fs::Result<u64> {
        let fb = info().ok_or(FsError::Io)?;
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Cur => *pos as i64,
            Whence::End => fb.size as i64,
        };
        let newpos = base.checked_add(off).ok_or(FsError::Invalid)?;
        if newpos < 0 {
            return Err(FsError::Invalid);
        }
        *pos = (newpos as u64).min(fb.size);
        Ok(*pos)
    }
}

/// Read-only geometry report.
struct FbCtlOps;

impl FileOps for FbCtlOps {
    fn read(&self, _file: &File, buf: &mut [u8], pos: &mut u64) -> crate::fs::Result<usize> {
        let fb = info().ok_or(FsError::Io)?;
        let text = alloc::format!(
            "width={} height={} pitch={} bpp={}\n",
            fb.width, fb.height, fb.pitch, fb.bpp
        );
        let bytes = text.as_bytes();
        let off = *pos as usize;
        if off >= bytes.len() {
            return Ok(0);
        }
        let n = (bytes.len() - off).min(buf.len());
        buf[..n].copy_from_slice(&bytes[off..off + n]);
        *pos += n as u64;
        Ok(n)
    }
}
