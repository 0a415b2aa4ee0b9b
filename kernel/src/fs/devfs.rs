//! devfs — synthetic device nodes.
//!
//! Drivers register nodes into a global table shared across all devfs
//! mounts: a name, a mode with the file-type bits set, and a file-ops
//! object. Built-ins are `null`, `zero` and `cons`; the PS/2 and
//! framebuffer drivers add `kbd`, `mouse`, `mousectl`, `fb` and `fbctl`,
//! and every registered block device appears under its driver-assigned
//! name through a wrapper that turns sector I/O into a seekable
//! byte-addressable node.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::RwLock;

use super::{
    dt_from_mode, mode, Dentry, DirEntry, File, FileOps, FsError, FsType, Inode, InodeOps,
    Result, Stat, Superblock, Whence,
};
use crate::block::BlockDevice;

/// Size of the global node table.
pub const MAX_NODES: usize = 64;

const ROOT_INO: u64 = 1;

struct DevNode {
    name: String,
    ino: u64,
    mode: u32,
    fops: Arc<dyn FileOps>,
}

struct Registry {
    /// Slots may be vacated by unregister; inode numbers stay stable.
    nodes: Vec<Option<DevNode>>,
    next_ino: u64,
}

/// Global node registry, shared by every devfs mount.
static NODES: RwLock<Registry> = RwLock::new(Registry {
    nodes: Vec::new(),
    next_ino: ROOT_INO + 1,
});

/// Register a device node. Fails with `Exists` on a duplicate name and
/// `NoMemory` when the table is full.
pub fn register_node(name: &str, node_mode: u32, fops: Arc<dyn FileOps>) -> Result<()> {
    if name.is_empty() || name.len() >= 64 {
        return Err(FsError::Invalid);
    }
    let mut reg = NODES.write();
    if reg
        .nodes
        .iter()
        .flatten()
        .any(|n| n.name == name)
    {
        return Err(FsError::Exists);
    }
    let ino = reg.next_ino;
    let node = DevNode {
        name: name.to_string(),
        ino,
        mode: node_mode,
        fops,
    };
    match reg.nodes.iter().position(|slot| slot.is_none()) {
        Some(vacant) => reg.nodes[vacant] = Some(node),
        None => {
            if reg.nodes.len() >= MAX_NODES {
                return Err(FsError::NoMemory);
            }
            reg.nodes.push(Some(node));
        }
    }
    reg.next_ino += 1;
    Ok(())
}

pub fn unregister_node(name: &str) -> Result<()> {
    let mut reg = NODES.write();
    for slot in reg.nodes.iter_mut() {
        if slot.as_ref().is_some_and(|n| n.name == name) {
            *slot = None;
            return Ok(());
        }
    }
    Err(FsError::NotFound)
}

/* ---- directory inode / file ops ---- */

struct DevDirIops;

impl InodeOps for DevDirIops {
    fn lookup(&self, dir: &Inode, child: &Dentry) -> Result<()> {
        let reg = NODES.read();
        let node = reg
            .nodes
            .iter()
            .flatten()
            .find(|n| n.name == child.name)
            .ok_or(FsError::NotFound)?;
        child.set_inode(Inode::new(
            node.ino,
            node.mode,
            dir.sb.clone(),
            Arc::new(DevNodeIops),
            node.fops.clone(),
        ));
        Ok(())
    }

    fn getattr(&self, inode: &Inode) -> Result<Stat> {
        Ok(Stat {
            ino: inode.ino,
            mode: inode.mode,
            nlink: 2,
            ..Stat::default()
        })
    }
}

struct DevNodeIops;

impl InodeOps for DevNodeIops {
    fn getattr(&self, inode: &Inode) -> Result<Stat> {
        Ok(Stat {
            ino: inode.ino,
            mode: inode.mode,
            nlink: 1,
            ..Stat::default()
        })
    }
}

struct DevDirFops;

impl FileOps for DevDirFops {
    /// One entry per in-use slot, advancing the offset past vacated
    /// slots; end-of-directory is `None`.
    fn readdir(&self, _file: &File, pos: &mut u64) -> Result<Option<DirEntry>> {
        let reg = NODES.read();
        let mut idx = *pos as usize;
        while idx < reg.nodes.len() {
            let slot = &reg.nodes[idx];
            idx += 1;
            if let Some(node) = slot {
                *pos = idx as u64;
                return Ok(Some(DirEntry {
                    ino: node.ino,
                    dtype: dt_from_mode(node.mode),
                    name: node.name.clone(),
                }));
            }
        }
        *pos = idx as u64;
        Ok(None)
    }
}

/* ---- built-in nodes ---- */

struct NullOps;

impl FileOps for NullOps {
    fn read(&self, _file: &File, _buf: &mut [u8], _pos: &mut u64) -> Result<usize> {
        Ok(0) // always EOF
    }

    fn write(&self, _file: &File, buf: &[u8], pos: &mut u64) -> Result<usize> {
        *pos += buf.len() as u64;
        Ok(buf.len()) // discard
    }
}

struct ZeroOps;

impl FileOps for ZeroOps {
    fn read(&self, _file: &File, buf: &mut [u8], pos: &mut u64) -> Result<usize> {
        buf.fill(0);
        *pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn write(&self, _file: &File, buf: &[u8], pos: &mut u64) -> Result<usize> {
        *pos += buf.len() as u64;
        Ok(buf.len())
    }
}

/// The console node: reads drain the keyboard ring buffer, writes go to
/// the text console.
struct ConsOps;

impl FileOps for ConsOps {
    fn read(&self, _file: &File, buf: &mut [u8], _pos: &mut u64) -> Result<usize> {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            Ok(crate::drivers::ps2::read_keyboard(buf))
        }
        #[cfg(not(target_os = "none"))]
        {
            let _ = buf;
            Ok(0)
        }
    }

    fn write(&self, _file: &File, buf: &[u8], pos: &mut u64) -> Result<usize> {
        if let Ok(s) = core::str::from_utf8(buf) {
            print!("{}", s);
        } else {
            for &b in buf {
                print!("{}", b as char);
            }
        }
        *pos += buf.len() as u64;
        Ok(buf.len())
    }
}

/* ---- block device wrapper ---- */

/// Adapts a block device to a seekable byte-addressable node by
/// read-modify-write at sector granularity.
pub struct BlockNodeOps {
    dev: &'static BlockDevice,
}

impl BlockNodeOps {
    fn span(&self, off: u64, len: usize) -> (u64, u64, usize) {
        let ss = self.dev.sector_size() as u64;
        let start_sector = off / ss;
        let end_sector = (off + len as u64).div_ceil(ss);
        let nsectors = end_sector - start_sector;
        (start_sector, nsectors, (off - start_sector * ss) as usize)
    }
}

impl FileOps for BlockNodeOps {
    fn read(&self, _file: &File, buf: &mut [u8], pos: &mut u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (start, nsectors, delta) = self.span(*pos, buf.len());
        let mut tmp = vec![0u8; (nsectors * self.dev.sector_size() as u64) as usize];
        self.dev
            .read(start, nsectors as u32, &mut tmp)
            .map_err(|_| FsError::Io)?;
        buf.copy_from_slice(&tmp[delta..delta + buf.len()]);
        *pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn write(&self, _file: &File, buf: &[u8], pos: &mut u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (start, nsectors, delta) = self.span(*pos, buf.len());
        let mut tmp = vec![0u8; (nsectors * self.dev.sector_size() as u64) as usize];
        // Preserve the partial head/tail sectors.
        self.dev
            .read(start, nsectors as u32, &mut tmp)
            .map_err(|_| FsError::Io)?;
        tmp[delta..delta + buf.len()].copy_from_slice(buf);
        self.dev
            .write(start, nsectors as u32, &tmp)
            .map_err(|_| FsError::Io)?;
        *pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn llseek(&self, _file: &File, pos: &mut u64, off: i64, whence: Whence) -> Result<u64> {
        let newpos = match whence {
            Whence::Set => off,
            Whence::Cur => *pos as i64 + off,
            Whence::End => return Err(FsError::Invalid), // size unknown
        };
        if newpos < 0 {
            return Err(FsError::Invalid);
        }
        *pos = newpos as u64;
        Ok(*pos)
    }
}

/// Expose a registered block device as `/dev/<name>`.
pub fn register_block_device(dev: &'static BlockDevice) -> Result<()> {
    register_node(dev.name(), mode::S_IFBLK | 0o600, Arc::new(BlockNodeOps { dev }))
}

/* ---- mount ---- */

pub struct DevFsType;

impl FsType for DevFsType {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn mount(
        &self,
        _device: Option<&'static BlockDevice>,
        flags: u32,
    ) -> Result<Arc<Superblock>> {
        let sb = Superblock::new("devfs", flags);
        let root_inode = Inode::new(
            ROOT_INO,
            mode::S_IFDIR | 0o755,
            sb.clone(),
            Arc::new(DevDirIops),
            Arc::new(DevDirFops),
        );
        sb.set_root(Dentry::new_root(root_inode));
        Ok(sb)
    }
}

/// Register the devfs type and its built-in nodes.
pub fn init(vfs: &super::Vfs) -> Result<()> {
    static DEVFS_TYPE: DevFsType = DevFsType;
    vfs.register_fs(&DEVFS_TYPE)?;
    let _ = register_node("null", mode::S_IFCHR | 0o666, Arc::new(NullOps));
    let _ = register_node("zero", mode::S_IFCHR | 0o666, Arc::new(ZeroOps));
    let _ = register_node("cons", mode::S_IFCHR | 0o666, Arc::new(ConsOps));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{OpenFlags, Vfs};

    static INITFS: crate::fs::initfs::InitFsType = crate::fs::initfs::InitFsType;

    /// Serialize tests that mutate the global node registry.
    fn registry_gate() -> std::sync::MutexGuard<'static, ()> {
        static GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());
        GATE.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn devfs_vfs() -> Vfs {
        let v = Vfs::new();
        v.register_fs(&INITFS).unwrap();
        v.mount("initfs", None, "/", 0).unwrap();
        init(&v).unwrap();
        v.mkdir("/dev", 0o755).unwrap();
        v.mount("devfs", None, "/dev", 0).unwrap();
        v
    }

    #[test]
    fn builtin_nodes_resolve_with_char_mode() {
        let _gate = registry_gate();
        let v = devfs_vfs();
        for name in ["/dev/null", "/dev/zero", "/dev/cons"] {
            let st = v.stat(name).unwrap();
            assert_eq!(st.mode & mode::S_IFMT, mode::S_IFCHR, "{}", name);
        }
    }

    #[test]
    fn null_discards_and_zero_fills() {
        let _gate = registry_gate();
        let v = devfs_vfs();

        let null = v.open("/dev/null", OpenFlags::RDWR, 0).unwrap();
        assert_eq!(null.write(b"discarded").unwrap(), 9);
        let mut buf = [0xFFu8; 8];
        assert_eq!(null.read(&mut buf).unwrap(), 0); // EOF on read

        let zero = v.open("/dev/zero", OpenFlags::RDONLY, 0).unwrap();
        let mut buf = [0xFFu8; 8];
        assert_eq!(zero.read(&mut buf).unwrap(), 8);
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn readdir_lists_each_builtin_exactly_once() {
        let _gate = registry_gate();
        let v = devfs_vfs();
        let dir = v.open("/dev", OpenFlags::RDONLY, 0).unwrap();

        let mut names = Vec::new();
        while let Some(entry) = dir.readdir().unwrap() {
            names.push(entry.name);
        }
        for want in ["null", "zero", "cons"] {
            assert_eq!(
                names.iter().filter(|n| n.as_str() == want).count(),
                1,
                "{} missing or duplicated in {:?}",
                want,
                names
            );
        }
    }

    #[test]
    fn block_node_round_trips_unaligned_io() {
        let _gate = registry_gate();
        let v = devfs_vfs();
        let dev = crate::block::testutil::mem_device("disktest", 512, vec![0u8; 512 * 8]);
        register_block_device(dev).unwrap();

        let f = v.open("/dev/disktest", OpenFlags::RDWR, 0).unwrap();
        f.seek(100, Whence::Set).unwrap();
        assert_eq!(f.write(b"unaligned write spans sectors").unwrap(), 29);

        f.seek(100, Whence::Set).unwrap();
        let mut buf = [0u8; 29];
        assert_eq!(f.read(&mut buf).unwrap(), 29);
        assert_eq!(&buf, b"unaligned write spans sectors");

        // Neighbouring bytes stay zero (read-modify-write preserved them).
        f.seek(96, Whence::Set).unwrap();
        let mut edge = [0xAAu8; 4];
        f.read(&mut edge).unwrap();
        assert_eq!(edge, [0u8; 4]);

        unregister_node("disktest").unwrap();
    }

    #[test]
    fn duplicate_registration_rejected() {
        let _gate = registry_gate();
        let r = register_node("null", mode::S_IFCHR | 0o666, Arc::new(NullOps));
        // "null" exists from a prior init in this or another test.
        assert!(matches!(r, Err(FsError::Exists)) || r.is_ok());
        if r.is_ok() {
            // First registration in this process; the second must fail.
            assert_eq!(
                register_node("null", mode::S_IFCHR | 0o666, Arc::new(NullOps)),
                Err(FsError::Exists)
            );
            unregister_node("null").unwrap();
        }
    }
}
