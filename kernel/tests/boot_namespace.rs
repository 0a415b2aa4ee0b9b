//! Namespace bring-up as performed by the boot path, minus hardware:
//! initfs as the permanent root, devfs overlaid at /dev, and the
//! standard device nodes behaving per their contracts.

use cerulean_kernel::fs::{devfs, initfs, mode, OpenFlags, Vfs, Whence};

static INITFS: initfs::InitFsType = initfs::InitFsType;

fn boot_namespace() -> Vfs {
    let vfs = Vfs::new();
    vfs.register_fs(&INITFS).unwrap();
    devfs::init(&vfs).unwrap();

    vfs.mount("initfs", None, "/", 0).unwrap();
    vfs.mkdir("/dev", 0o755).unwrap();
    vfs.mount("devfs", None, "/dev", 0).unwrap();
    vfs
}

#[test]
fn no_disk_boot_flow() {
    let vfs = boot_namespace();

    // The root resolves and is a directory.
    let root = vfs.stat("/").unwrap();
    assert!(mode::is_dir(root.mode));

    // /dev resolved through the devfs overlay.
    let dev = vfs.lookup("/dev").unwrap();
    assert_eq!(dev.mount.sb.fs_name, "devfs");

    // No /bin/init exists anywhere: process creation would fail with
    // not-found, which the boot path reports as "no init".
    assert!(vfs.lookup("/bin/init").is_err());
}

#[test]
fn standard_nodes_present_and_functional() {
    let vfs = boot_namespace();

    let names = ["/dev/null", "/dev/zero", "/dev/cons"];
    for name in names {
        let st = vfs.stat(name).unwrap();
        assert_eq!(st.mode & mode::S_IFMT, mode::S_IFCHR, "{}", name);
    }

    let null = vfs.open("/dev/null", OpenFlags::RDWR, 0).unwrap();
    assert_eq!(null.write(b"into the void").unwrap(), 13);
    let mut buf = [1u8; 4];
    assert_eq!(null.read(&mut buf).unwrap(), 0);

    let zero = vfs.open("/dev/zero", OpenFlags::RDONLY, 0).unwrap();
    let mut buf = [0xEEu8; 16];
    assert_eq!(zero.read(&mut buf).unwrap(), 16);
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn seek_and_reopen_are_independent() {
    let vfs = boot_namespace();

    let a = vfs.open("/dev/zero", OpenFlags::RDONLY, 0).unwrap();
    let b = vfs.open("/dev/zero", OpenFlags::RDONLY, 0).unwrap();
    let mut buf = [0u8; 8];
    a.read(&mut buf).unwrap();
    a.read(&mut buf).unwrap();
    assert_eq!(a.seek(0, Whence::Cur).unwrap(), 16);
    assert_eq!(b.seek(0, Whence::Cur).unwrap(), 0);
}

#[test]
fn pipe_carries_one_hundred_bytes() {
    let (read_end, write_end) = cerulean_kernel::fs::pipe::create().unwrap();
    let data: Vec<u8> = (0..100u8).collect();
    assert_eq!(write_end.write(&data).unwrap(), 100);
    let mut out = [0u8; 100];
    assert_eq!(read_end.read(&mut out).unwrap(), 100);
    assert_eq!(&out[..], &data[..]);
}
