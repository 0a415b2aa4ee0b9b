//! Kernel pipes.
//!
//! A 4 KiB byte ring under an interrupt-safe lock, with blocking read
//! and write that yield between retries. The two ends are distinct file
//! objects sharing the ring; the backing store is freed when the last
//! reference to both ends is gone.

use alloc::sync::Arc;

use super::{mode, File, FileOps, FsError, Inode, Result, Superblock};
use crate::sync::SpinLock;

/// Ring capacity in bytes.
pub const PIPE_BUF: usize = 4096;

/// Inode numbers tagging which end a file represents.
const READ_END: u64 = 1;
const WRITE_END: u64 = 2;

struct PipeInner {
    buf: [u8; PIPE_BUF],
    read_pos: usize,
    write_pos: usize,
    count: usize,
    read_open: bool,
    write_open: bool,
}

struct Pipe {
    inner: SpinLock<PipeInner>,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new(
                "pipe",
                PipeInner {
                    buf: [0; PIPE_BUF],
                    read_pos: 0,
                    write_pos: 0,
                    count: 0,
                    read_open: true,
                    write_open: true,
                },
            ),
        })
    }
}

/// Give other runnable work a chance while a pipe end waits.
fn relax() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::sched::yield_now();
    #[cfg(not(target_os = "none"))]
    std::thread::yield_now();
}

struct PipeReadOps {
    pipe: Arc<Pipe>,
}

impl FileOps for PipeReadOps {
    /// Blocks until `buf.len()` bytes have arrived or the write end
    /// closes; returns the bytes read so far at EOF.
    fn read(&self, _file: &File, buf: &mut [u8], _pos: &mut u64) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            {
                let mut p = self.pipe.inner.lock();
                if p.count > 0 {
                    let n = (buf.len() - read).min(p.count);
                    for byte in buf[read..read + n].iter_mut() {
                        *byte = p.buf[p.read_pos % PIPE_BUF];
                        p.read_pos = p.read_pos.wrapping_add(1);
                        p.count -= 1;
                    }
                    read += n;
                    continue;
                }
                if !p.write_open {
                    return Ok(read); // EOF
                }
            }
            relax();
        }
        Ok(read)
    }

    fn close(&self, _file: &File) {
        self.pipe.inner.lock().read_open = false;
    }
}

struct PipeWriteOps {
    pipe: Arc<Pipe>,
}

impl FileOps for PipeWriteOps {
    /// Blocks until all bytes fit; a closed read end is a broken pipe.
    fn write(&self, _file: &File, buf: &[u8], _pos: &mut u64) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            {
                let mut p = self.pipe.inner.lock();
                if !p.read_open {
                    return Err(FsError::Io); // broken pipe
                }
                if p.count < PIPE_BUF {
                    let n = (buf.len() - written).min(PIPE_BUF - p.count);
                    for &byte in &buf[written..written + n] {
                        let at = p.write_pos % PIPE_BUF;
                        p.buf[at] = byte;
                        p.write_pos = p.write_pos.wrapping_add(1);
                        p.count += 1;
                    }
                    written += n;
                    continue;
                }
            }
            relax();
        }
        Ok(written)
    }

    fn close(&self, _file: &File) {
        self.pipe.inner.lock().write_open = false;
    }
}

/// Anonymous superblock giving pipe inodes an identity.
fn pipe_sb() -> Arc<Superblock> {
    static SB: spin::Once<Arc<Superblock>> = spin::Once::new();
    SB.call_once(|| Superblock::new("pipefs", 0)).clone()
}

/// Create a pipe, returning `(read_end, write_end)`.
pub fn create() -> Result<(Arc<File>, Arc<File>)> {
    let pipe = Pipe::new();

    let read_inode = Inode::new(
        READ_END,
        mode::S_IFIFO | 0o600,
        pipe_sb(),
        Arc::new(NoInodeOps),
        Arc::new(PipeReadOps { pipe: pipe.clone() }),
    );
    let write_inode = Inode::new(
        WRITE_END,
        mode::S_IFIFO | 0o600,
        pipe_sb(),
        Arc::new(NoInodeOps),
        Arc::new(PipeWriteOps { pipe }),
    );

    Ok((
        File::new(read_inode, super::OpenFlags::RDONLY),
        File::new(write_inode, super::OpenFlags::WRONLY),
    ))
}

/// Pipes have no directory or metadata surface.
struct NoInodeOps;

impl super::InodeOps for NoInodeOps {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hundred_bytes_flow_through() {
        let (r, w) = create().unwrap();
        let data: alloc::vec::Vec<u8> = (0..100u8).collect();
        assert_eq!(w.write(&data).unwrap(), 100);

        let mut out = [0u8; 100];
        assert_eq!(r.read(&mut out).unwrap(), 100);
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn eof_after_writer_closes() {
        let (r, w) = create().unwrap();
        w.write(b"tail").unwrap();
        drop(w);

        let mut out = [0u8; 16];
        assert_eq!(r.read(&mut out).unwrap(), 4);
        assert_eq!(&out[..4], b"tail");
        assert_eq!(r.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn write_to_closed_reader_is_broken_pipe() {
        let (r, w) = create().unwrap();
        drop(r);
        assert_eq!(w.write(b"x"), Err(FsError::Io));
    }

    #[test]
    fn wraps_around_capacity_with_concurrent_reader() {
        let (r, w) = create().unwrap();
        let payload: alloc::vec::Vec<u8> = (0..(3 * PIPE_BUF)).map(|i| (i % 251) as u8).collect();
        let expect = payload.clone();

        let writer = std::thread::spawn(move || {
            w.write(&payload).unwrap();
        });

        let mut out = alloc::vec![0u8; 3 * PIPE_BUF];
        assert_eq!(r.read(&mut out).unwrap(), 3 * PIPE_BUF);
        writer.join().unwrap();
        assert_eq!(out, expect);
    }
}
