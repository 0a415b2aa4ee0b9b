//! PS/2 controller: keyboard and mouse.
//!
//! Scancodes are decoded through the `pc-keyboard` crate into a
//! character ring that backs `/dev/cons` reads; the raw scancode stream
//! and the 3-byte mouse packet stream feed `/dev/kbd` and `/dev/mouse`.

use alloc::sync::Arc;

use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::fs::{devfs, mode, File, FileOps, FsError};
use crate::sync::SpinLock;

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;
const CMD_PORT: u16 = 0x64;

const STATUS_OUTPUT_FULL: u8 = 1 << 0;
const STATUS_INPUT_FULL: u8 = 1 << 1;

/// Fixed-capacity byte ring; oldest data is overwritten on overflow.
struct Ring<const N: usize> {
    buf: [u8; N],
    head: usize,
    len: usize,
}

impl<const N: usize> Ring<N> {
    const fn new() -> Self {
        Self {
            buf: [0; N],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.head] = byte;
        self.head = (self.head + 1) % N;
        if self.len < N {
            self.len += 1;
        }
    }

    fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let n = self.len.min(out.len());
        let mut idx = (self.head + N - self.len) % N;
        for slot in out.iter_mut().take(n) {
            *slot = self.buf[idx];
            idx = (idx + 1) % N;
        }
        self.len -= n;
        n
    }
}

const KBD_BUF_LEN: usize = 1024;

static KBD_CHARS: SpinLock<Ring<KBD_BUF_LEN>> = SpinLock::new("kbdchars", Ring::new());
static KBD_RAW: SpinLock<Ring<256>> = SpinLock::new("kbdraw", Ring::new());
static MOUSE_PACKETS: SpinLock<Ring<512>> = SpinLock::new("mouse", Ring::new());

static DECODER: Mutex<Option<Keyboard<layouts::Us104Key, ScancodeSet1>>> = Mutex::new(None);

fn read_data() -> u8 {
    // SAFETY: PS/2 data port read.
    unsafe { Port::<u8>::new(DATA_PORT).read() }
}

fn read_status() -> u8 {
    // SAFETY: PS/2 status port read.
    unsafe { Port::<u8>::new(STATUS_PORT).read() }
}

fn wait_input_clear() {
    for _ in 0..100_000 {
        if read_status() & STATUS_INPUT_FULL == 0 {
            return;
        }
        core::hint::spin_loop();
    }
}

fn wait_output_full() {
    for _ in 0..100_000 {
        if read_status() & STATUS_OUTPUT_FULL != 0 {
            return;
        }
        core::hint::spin_loop();
    }
}

fn controller_command(cmd: u8) {
    wait_input_clear();
    // SAFETY: PS/2 controller command write.
    unsafe { Port::<u8>::new(CMD_PORT).write(cmd) }
}

fn device_write(byte: u8) {
    wait_input_clear();
    // SAFETY: PS/2 data port write.
    unsafe { Port::<u8>::new(DATA_PORT).write(byte) }
}

fn aux_write(byte: u8) {
    controller_command(0xD4);
    device_write(byte);
}

/// Keyboard IRQ (vector 33): decode and buffer.
pub fn keyboard_interrupt() {
    let scancode = read_data();
    KBD_RAW.lock().push(scancode);

    let mut decoder = DECODER.lock();
    if let Some(kbd) = decoder.as_mut() {
        if let Ok(Some(event)) = kbd.add_byte(scancode) {
            if let Some(DecodedKey::Unicode(c)) = kbd.process_keyevent(event) {
                let mut chars = KBD_CHARS.lock();
                let mut utf8 = [0u8; 4];
                for &b in c.encode_utf8(&mut utf8).as_bytes() {
                    chars.push(b);
                }
            }
        }
    }
}

/// Mouse IRQ (vector 44): buffer the packet byte stream.
pub fn mouse_interrupt() {
    MOUSE_PACKETS.lock().push(read_data());
}

/// Drain decoded characters; backs `/dev/cons`.
pub fn read_keyboard(buf: &mut [u8]) -> usize {
    KBD_CHARS.lock().pop_into(buf)
}

pub fn read_keyboard_raw(buf: &mut [u8]) -> usize {
    KBD_RAW.lock().pop_into(buf)
}

pub fn read_mouse(buf: &mut [u8]) -> usize {
    MOUSE_PACKETS.lock().pop_into(buf)
}

/* ---- devfs nodes ---- */

struct KbdOps;

impl FileOps for KbdOps {
    fn read(&self, _file: &File, buf: &mut [u8], _pos: &mut u64) -> crate::fs::Result<usize> {
        Ok(read_keyboard_raw(buf))
    }
}

struct MouseOps;

impl FileOps for MouseOps {
    fn read(&self, _file: &File, buf: &mut [u8], _pos: &mut u64) -> crate::fs::Result<usize> {
        Ok(read_mouse(buf))
    }
}

/// Control node: a reset command re-enables mouse streaming.
struct MouseCtlOps;

impl FileOps for MouseCtlOps {
    fn read(&self, _file: &File, buf: &mut [u8], pos: &mut u64) -> crate::fs::Result<usize> {
        let text = b"stream\n";
        let off = *pos as usize;
        if off >= text.len() {
            return Ok(0);
        }
        let n = (text.len() - off).min(buf.len());
        buf[..n].copy_from_slice(&text[off..off + n]);
        *pos += n as u64;
        Ok(n)
    }

    fn write(&self, _file: &File, buf: &[u8], pos: &mut u64) -> crate::fs::Result<usize> {
        if buf.starts_with(b"reset") {
            aux_write(0xF6); // defaults
            aux_write(0xF4); // enable reporting
        } else {
            return Err(FsError::Invalid);
        }
        *pos += buf.len() as u64;
        Ok(buf.len())
    }
}

/// Initialize the controller, keyboard and mouse, and publish the
/// device nodes. IRQ routing happens separately at the I/O APIC.
pub fn init() {
    *DECODER.lock() = Some(Keyboard::new(
        ScancodeSet1::new(),
        layouts::Us104Key,
        HandleControl::Ignore,
    ));

    // Disable both ports while reconfiguring.
    controller_command(0xAD);
    controller_command(0xA7);

    // Flush pending output.
    while read_status() & STATUS_OUTPUT_FULL != 0 {
        read_data();
    }

    // Config byte: enable IRQ1 + IRQ12, keep translation as-is.
    controller_command(0x20);
    wait_output_full();
    let mut config = read_data();
    config |= 0b11; // port 1 + port 2 interrupts
    controller_command(0x60);
    device_write(config);

    // Re-enable ports.
    controller_command(0xAE);
    controller_command(0xA8);

    // Keyboard: enable scanning.
    device_write(0xF4);

    // Mouse: defaults, then stream reporting.
    aux_write(0xF6);
    aux_write(0xF4);

    let _ = devfs::register_node("kbd", mode::S_IFCHR | 0o444, Arc::new(KbdOps));
    let _ = devfs::register_node("mouse", mode::S_IFCHR | 0o444, Arc::new(MouseOps));
    let _ = devfs::register_node("mousectl", mode::S_IFCHR | 0o644, Arc::new(MouseCtlOps));

    log::info!(target: "ps2", "keyboard and mouse online");
}
