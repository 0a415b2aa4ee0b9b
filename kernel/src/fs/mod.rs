//! Virtual filesystem
//!
//! Path resolution across mounts, reference-counted superblock / inode /
//! dentry / file objects, and ops dispatch into the concrete backends
//! (initfs, devfs, ext2, pipes).
//!
//! Two dentry lifecycles coexist: *persistent* dentries are owned by the
//! superblock that produced them (the root of each mount); *temporary*
//! dentries are allocated during lookups, handed up through child slots
//! and freed when the last reference drops. Mountpoint crossing during a
//! walk matches by (superblock, inode-number) identity because child
//! dentries are temporaries and pointer comparison would never match.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, Once, RwLock};

pub mod devfs;
pub mod ext2;
pub mod initfs;
pub mod pipe;

/// Maximum filename length accepted by the walk.
pub const NAME_MAX: usize = 255;

/* ----------------------------- errors ----------------------------- */

/// Filesystem error codes. The numeric values are part of the syscall
/// ABI and surface unchanged to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum FsError {
    Invalid,
    NotFound,
    NotDir,
    Exists,
    NotSupported,
    NoMemory,
    Busy,
    Io,
}

impl FsError {
    pub fn code(self) -> i64 {
        match self {
            FsError::Invalid => -22,
            FsError::NotFound => -2,
            FsError::NotDir => -20,
            FsError::Exists => -17,
            FsError::NotSupported => -38,
            FsError::NoMemory => -12,
            FsError::Busy => -16,
            FsError::Io => -5,
        }
    }
}

impl From<crate::error::KernelError> for FsError {
    fn from(e: crate::error::KernelError) -> Self {
        match e {
            crate::error::KernelError::OutOfMemory => FsError::NoMemory,
            crate::error::KernelError::Io => FsError::Io,
            crate::error::KernelError::Fs(f) => f,
            _ => FsError::Invalid,
        }
    }
}

pub type Result<T> = core::result::Result<T, FsError>;

/* ----------------------------- modes ----------------------------- */

/// Classical file-type high bits of an inode mode.
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;

    pub fn is_dir(mode: u32) -> bool {
        mode & S_IFMT == S_IFDIR
    }

    pub fn is_reg(mode: u32) -> bool {
        mode & S_IFMT == S_IFREG
    }
}

/// Directory-entry type byte, following the ext2 on-disk convention
/// which all backends report through readdir.
pub mod dirent_type {
    pub const UNKNOWN: u8 = 0;
    pub const REG: u8 = 1;
    pub const DIR: u8 = 2;
    pub const CHR: u8 = 3;
    pub const BLK: u8 = 4;
    pub const FIFO: u8 = 5;
    pub const SOCK: u8 = 6;
    pub const LNK: u8 = 7;
}

/// Derive the readdir type byte from an inode mode.
pub fn dt_from_mode(m: u32) -> u8 {
    match m & mode::S_IFMT {
        mode::S_IFREG => dirent_type::REG,
        mode::S_IFDIR => dirent_type::DIR,
        mode::S_IFCHR => dirent_type::CHR,
        mode::S_IFBLK => dirent_type::BLK,
        mode::S_IFIFO => dirent_type::FIFO,
        mode::S_IFSOCK => dirent_type::SOCK,
        mode::S_IFLNK => dirent_type::LNK,
        _ => dirent_type::UNKNOWN,
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0x0001;
        const WRONLY = 0x0002;
        const RDWR   = 0x0003;
        const CREAT  = 0x0100;
        const TRUNC  = 0x0200;
        const APPEND = 0x0400;
        const EXCL   = 0x0800;
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl TryFrom<u64> for Whence {
    type Error = FsError;
    fn try_from(v: u64) -> Result<Self> {
        match v {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(FsError::Invalid),
        }
    }
}

/* ----------------------------- metadata ----------------------------- */

/// stat(2)-style metadata; `#[repr(C)]` because fstat copies it to user
/// memory verbatim.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Stat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// One directory entry, as emitted by readdir (one per call).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub dtype: u8,
    pub name: String,
}

/* ----------------------------- ops traits ----------------------------- */

/// Directory and metadata operations of an inode. A default method
/// stands in for an absent vtable entry and reports `NotSupported`.
pub trait InodeOps: Send + Sync {
    /// Look `child.name` up under `dir`; a successful return must have
    /// set `child`'s inode.
    fn lookup(&self, _dir: &Inode, _child: &Dentry) -> Result<()> {
        Err(FsError::NotSupported)
    }

    fn create(&self, _dir: &Inode, _child: &Dentry, _mode: u32) -> Result<()> {
        Err(FsError::NotSupported)
    }

    fn mkdir(&self, _dir: &Inode, _child: &Dentry, _mode: u32) -> Result<()> {
        Err(FsError::NotSupported)
    }

    fn unlink(&self, _dir: &Inode, _name: &str) -> Result<()> {
        Err(FsError::NotSupported)
    }

    fn getattr(&self, _inode: &Inode) -> Result<Stat> {
        Err(FsError::NotSupported)
    }
}

/// Operations on an open file. Defaults mirror absent vtable entries.
pub trait FileOps: Send + Sync {
    fn open(&self, _inode: &Arc<Inode>, _file: &File) -> Result<()> {
        Ok(())
    }

    fn close(&self, _file: &File) {}

    fn read(&self, _file: &File, _buf: &mut [u8], _pos: &mut u64) -> Result<usize> {
        Err(FsError::NotSupported)
    }

    fn write(&self, _file: &File, _buf: &[u8], _pos: &mut u64) -> Result<usize> {
        Err(FsError::NotSupported)
    }

    /// Backend-specific seek; when unsupported the VFS falls back to a
    /// generic seek computed from getattr's size.
    fn llseek(&self, _file: &File, _pos: &mut u64, _off: i64, _whence: Whence) -> Result<u64> {
        Err(FsError::NotSupported)
    }

    fn readdir(&self, _file: &File, _pos: &mut u64) -> Result<Option<DirEntry>> {
        Err(FsError::NotSupported)
    }
}

/// The empty file-ops vtable: every operation reports `NotSupported`.
pub struct NoFileOps;

impl FileOps for NoFileOps {}

/* ----------------------------- core objects ----------------------------- */

/// One instance of a filesystem backend; owns its root dentry.
pub struct Superblock {
    pub fs_name: &'static str,
    pub flags: u32,
    root: Once<Arc<Dentry>>,
}

impl Superblock {
    pub fn new(fs_name: &'static str, flags: u32) -> Arc<Self> {
        Arc::new(Self {
            fs_name,
            flags,
            root: Once::new(),
        })
    }

    /// Install the root dentry; backends call this exactly once at mount.
    pub fn set_root(&self, root: Arc<Dentry>) {
        self.root.call_once(|| root);
    }

    pub fn root(&self) -> Option<Arc<Dentry>> {
        self.root.get().cloned()
    }
}

/// A file / directory / device identity within one superblock.
pub struct Inode {
    pub ino: u64,
    pub mode: u32,
    pub sb: Arc<Superblock>,
    pub iops: Arc<dyn InodeOps>,
    pub fops: Arc<dyn FileOps>,
}

impl Inode {
    pub fn new(
        ino: u64,
        mode: u32,
        sb: Arc<Superblock>,
        iops: Arc<dyn InodeOps>,
        fops: Arc<dyn FileOps>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            mode,
            sb,
            iops,
            fops,
        })
    }

    pub fn is_dir(&self) -> bool {
        mode::is_dir(self.mode)
    }

    /// Identity used for mountpoint matching during walks.
    pub fn same_identity(&self, other: &Inode) -> bool {
        self.ino == other.ino && Arc::ptr_eq(&self.sb, &other.sb)
    }
}

/// A name binding to an inode within some parent directory.
pub struct Dentry {
    pub name: String,
    pub parent: Option<Arc<Dentry>>,
    inode: Once<Arc<Inode>>,
    is_mountpoint: AtomicBool,
}

impl Dentry {
    /// A superblock root dentry (persistent, owned by the superblock).
    pub fn new_root(inode: Arc<Inode>) -> Arc<Self> {
        let d = Arc::new(Self {
            name: String::from("/"),
            parent: None,
            inode: Once::new(),
            is_mountpoint: AtomicBool::new(false),
        });
        d.inode.call_once(|| inode);
        d
    }

    /// A temporary dentry for one path-resolution step; freed when the
    /// last reference drops.
    pub fn new_temp(name: &str, parent: Option<Arc<Dentry>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            parent,
            inode: Once::new(),
            is_mountpoint: AtomicBool::new(false),
        })
    }

    /// Bind the inode; backend lookup/create call this on success.
    pub fn set_inode(&self, inode: Arc<Inode>) {
        self.inode.call_once(|| inode);
    }

    pub fn inode(&self) -> Option<Arc<Inode>> {
        self.inode.get().cloned()
    }

    pub fn is_mountpoint(&self) -> bool {
        self.is_mountpoint.load(Ordering::Acquire)
    }
}

/// A mounted superblock and where it hangs in the namespace.
pub struct Mount {
    pub sb: Arc<Superblock>,
    pub root: Arc<Dentry>,
    /// The covered dentry; `None` for the global root mount.
    pub mountpoint: Option<Arc<Dentry>>,
    pub flags: u32,
}

/// An open handle carrying the file offset.
pub struct File {
    pub flags: OpenFlags,
    pub inode: Arc<Inode>,
    pos: Mutex<u64>,
}

impl File {
    pub fn new(inode: Arc<Inode>, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            flags,
            inode,
            pos: Mutex::new(0),
        })
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut pos = self.pos.lock();
        self.inode.fops.read(self, buf, &mut pos)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut pos = self.pos.lock();
        self.inode.fops.write(self, buf, &mut pos)
    }

    pub fn seek(&self, off: i64, whence: Whence) -> Result<u64> {
        let mut pos = self.pos.lock();
        match self.inode.fops.llseek(self, &mut pos, off, whence) {
            Err(FsError::NotSupported) => {}
            other => return other,
        }
        // Generic seek, only possible when the size is known.
        let st = self.inode.iops.getattr(&self.inode)?;
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Cur => *pos as i64,
            Whence::End => st.size as i64,
        };
        let newpos = base.checked_add(off).ok_or(FsError::Invalid)?;
        if newpos < 0 {
            return Err(FsError::Invalid);
        }
        *pos = newpos as u64;
        Ok(*pos)
    }

    pub fn stat(&self) -> Result<Stat> {
        self.inode.iops.getattr(&self.inode)
    }

    pub fn readdir(&self) -> Result<Option<DirEntry>> {
        let mut pos = self.pos.lock();
        self.inode.fops.readdir(self, &mut pos)
    }

    pub fn pos(&self) -> u64 {
        *self.pos.lock()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.inode.fops.close(self);
    }
}

/* ----------------------------- fs type registry ----------------------------- */

/// A filesystem backend type descriptor, installed at init.
pub trait FsType: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a superblock (with its root dentry installed) for one
    /// instance of this filesystem.
    fn mount(
        &self,
        device: Option<&'static crate::block::BlockDevice>,
        flags: u32,
    ) -> Result<Arc<Superblock>>;
}

/* ----------------------------- namespace ----------------------------- */

/// The resolved endpoint of a full lookup.
pub struct ResolvedPath {
    pub mount: Arc<Mount>,
    pub dentry: Arc<Dentry>,
}

/// A filesystem namespace: registered types, mount table, global root.
pub struct Vfs {
    fs_types: RwLock<Vec<&'static dyn FsType>>,
    mounts: RwLock<Vec<Arc<Mount>>>,
    root: RwLock<Option<Arc<Mount>>>,
}

/// The kernel's namespace.
static VFS: Vfs = Vfs::new();

pub fn vfs() -> &'static Vfs {
    &VFS
}

impl Vfs {
    pub const fn new() -> Self {
        Self {
            fs_types: RwLock::new(Vec::new()),
            mounts: RwLock::new(Vec::new()),
            root: RwLock::new(None),
        }
    }

    /* ---- registry ---- */

    pub fn register_fs(&self, fstype: &'static dyn FsType) -> Result<()> {
        let mut types = self.fs_types.write();
        if types.iter().any(|t| t.name() == fstype.name()) {
            return Err(FsError::Exists);
        }
        types.push(fstype);
        Ok(())
    }

    fn find_fs(&self, name: &str) -> Option<&'static dyn FsType> {
        self.fs_types.read().iter().copied().find(|t| t.name() == name)
    }

    /* ---- mount table ---- */

    /// The most recent mount covering `dentry` (later mounts shadow
    /// earlier ones on the same mountpoint).
    fn mount_on_dentry(&self, dentry: &Arc<Dentry>) -> Option<Arc<Mount>> {
        self.mounts
            .read()
            .iter()
            .rev()
            .find(|m| {
                m.mountpoint
                    .as_ref()
                    .is_some_and(|mp| Arc::ptr_eq(mp, dentry))
            })
            .cloned()
    }

    /// The most recent mount whose mountpoint has this inode identity.
    fn mount_on_inode(&self, inode: &Inode) -> Option<Arc<Mount>> {
        self.mounts
            .read()
            .iter()
            .rev()
            .find(|m| {
                m.mountpoint
                    .as_ref()
                    .and_then(|mp| mp.inode())
                    .is_some_and(|i| i.same_identity(inode))
            })
            .cloned()
    }

    /// Mount filesystem `type_name` (optionally backed by `device`) at
    /// `target`. The first mount targeting "/" while no root exists
    /// becomes the global root mount.
    pub fn mount(
        &self,
        type_name: &str,
        device: Option<&'static crate::block::BlockDevice>,
        target: &str,
        flags: u32,
    ) -> Result<()> {
        let fstype = self.find_fs(type_name).ok_or(FsError::NotFound)?;

        let is_root_mount = target == "/" && self.root.read().is_none();
        let mountpoint = if is_root_mount {
            None
        } else {
            let resolved = self.lookup(target)?;
            let inode = resolved.dentry.inode().ok_or(FsError::Invalid)?;
            if !inode.is_dir() {
                return Err(FsError::NotDir);
            }
            Some(resolved.dentry)
        };

        let sb = fstype.mount(device, flags)?;
        let root = sb.root().ok_or(FsError::Invalid)?;
        if root.inode().is_none() {
            return Err(FsError::Invalid);
        }

        let mount = Arc::new(Mount {
            sb,
            root,
            mountpoint: mountpoint.clone(),
            flags,
        });

        if is_root_mount {
            *self.root.write() = Some(mount.clone());
        } else if let Some(mp) = mountpoint {
            mp.is_mountpoint.store(true, Ordering::Release);
        }
        self.mounts.write().push(mount);
        Ok(())
    }

    /// Unmount whatever is mounted at `target`, restoring the covered
    /// resolution. The global root mount itself cannot be unmounted.
    pub fn umount(&self, target: &str) -> Result<()> {
        let resolved = self.lookup(target)?;

        let mut mounts = self.mounts.write();
        let idx = mounts
            .iter()
            .rposition(|m| Arc::ptr_eq(&m.root, &resolved.dentry))
            .ok_or(FsError::NotFound)?;

        let Some(mountpoint) = mounts[idx].mountpoint.clone() else {
            return Err(FsError::Busy); // the root mount
        };

        mounts.remove(idx);

        // Keep the flag consistent: set iff some remaining mount still
        // covers this dentry.
        let still_covered = mounts.iter().any(|m| {
            m.mountpoint
                .as_ref()
                .is_some_and(|mp| Arc::ptr_eq(mp, &mountpoint))
        });
        mountpoint
            .is_mountpoint
            .store(still_covered, Ordering::Release);
        Ok(())
    }

    /* ---- path resolution ---- */

    /// Anchor a walk at the global root, following an overlay mounted on
    /// the root dentry before any component is consumed.
    fn root_anchor(&self) -> Result<(Arc<Mount>, Arc<Dentry>)> {
        let root = self.root.read().clone().ok_or(FsError::Invalid)?;
        let mut mount = root.clone();
        let mut dentry = root.root.clone();
        if dentry.is_mountpoint() {
            if let Some(overlay) = self.mount_on_dentry(&dentry) {
                dentry = overlay.root.clone();
                mount = overlay;
            }
        }
        Ok((mount, dentry))
    }

    /// One walk step through a named component.
    fn lookup_child(
        &self,
        mount: Arc<Mount>,
        dir: Arc<Dentry>,
        name: &str,
    ) -> Result<(Arc<Mount>, Arc<Dentry>)> {
        if name.len() > NAME_MAX {
            return Err(FsError::Invalid);
        }
        let dir_inode = dir.inode().ok_or(FsError::NotFound)?;
        if !dir_inode.is_dir() {
            return Err(FsError::NotDir);
        }

        let child = Dentry::new_temp(name, Some(dir));
        dir_inode.iops.lookup(&dir_inode, &child)?;
        let child_inode = child.inode().ok_or(FsError::NotFound)?;

        // If this inode is a mountpoint, the walk jumps into the mounted
        // root and the temporary is dropped.
        if let Some(sub) = self.mount_on_inode(&child_inode) {
            let root = sub.root.clone();
            return Ok((sub, root));
        }

        Ok((mount, child))
    }

    /// Step upward for a `..` component; at a mount root this crosses to
    /// the mountpoint in the covering namespace.
    fn step_up(
        &self,
        mount: Arc<Mount>,
        cur: Arc<Dentry>,
    ) -> (Arc<Mount>, Arc<Dentry>) {
        if Arc::ptr_eq(&cur, &mount.root) {
            if let Some(mp) = mount.mountpoint.clone() {
                // The mountpoint dentry lives in the mount whose
                // superblock produced its inode.
                let parent_mount = mp
                    .inode()
                    .and_then(|i| {
                        self.mounts
                            .read()
                            .iter()
                            .find(|m| Arc::ptr_eq(&m.sb, &i.sb))
                            .cloned()
                    })
                    .unwrap_or_else(|| mount.clone());
                return (parent_mount, mp);
            }
            return (mount, cur); // global root: .. stays put
        }
        match cur.parent.clone() {
            Some(parent) => (mount, parent),
            None => (mount, cur),
        }
    }

    /// Full lookup: resolve `path` to its final (mount, dentry).
    pub fn lookup(&self, path: &str) -> Result<ResolvedPath> {
        let (mut mount, mut cur) = self.root_anchor()?;

        for comp in path.split('/').filter(|c| !c.is_empty()) {
            match comp {
                "." => {}
                ".." => (mount, cur) = self.step_up(mount, cur),
                name => (mount, cur) = self.lookup_child(mount, cur, name)?,
            }
        }

        Ok(ResolvedPath { mount, dentry: cur })
    }

    /// Parent lookup: resolve to the parent directory of the final
    /// component, returning (mount, parent dentry, leaf name). Used by
    /// create / mkdir / unlink.
    pub fn lookup_parent(&self, path: &str) -> Result<(Arc<Mount>, Arc<Dentry>, String)> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some((&leaf, walk)) = components.split_last() else {
            // "/" or "": no leaf.
            let (mount, cur) = self.root_anchor()?;
            return Ok((mount, cur, String::new()));
        };

        let (mut mount, mut cur) = self.root_anchor()?;
        for &comp in walk {
            match comp {
                "." => {}
                ".." => (mount, cur) = self.step_up(mount, cur),
                name => (mount, cur) = self.lookup_child(mount, cur, name)?,
            }
        }

        match leaf {
            "." | ".." => Err(FsError::Invalid),
            _ => Ok((mount, cur, leaf.to_string())),
        }
    }

    /* ---- file API ---- */

    /// Open `path`. With `CREAT`, the parent is resolved and asked to
    /// create the leaf; the temporary dentry is dropped after the inode
    /// reference is taken.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Arc<File>> {
        let inode = if flags.contains(OpenFlags::CREAT) {
            let (_mount, parent, leaf) = self.lookup_parent(path)?;
            if leaf.is_empty() {
                return Err(FsError::Invalid);
            }
            let parent_inode = parent.inode().ok_or(FsError::NotFound)?;
            if !parent_inode.is_dir() {
                return Err(FsError::NotDir);
            }
            let child = Dentry::new_temp(&leaf, Some(parent));
            parent_inode.iops.create(&parent_inode, &child, mode)?;
            child.inode().ok_or(FsError::Invalid)?
        } else {
            let resolved = self.lookup(path)?;
            resolved.dentry.inode().ok_or(FsError::NotFound)?
        };

        let file = File::new(inode.clone(), flags);
        inode.fops.open(&inode, &file)?;
        Ok(file)
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let resolved = self.lookup(path)?;
        let inode = resolved.dentry.inode().ok_or(FsError::NotFound)?;
        inode.iops.getattr(&inode)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let (_mount, parent, leaf) = self.lookup_parent(path)?;
        if leaf.is_empty() {
            return Err(FsError::Invalid);
        }
        let parent_inode = parent.inode().ok_or(FsError::NotFound)?;
        if !parent_inode.is_dir() {
            return Err(FsError::NotDir);
        }
        let child = Dentry::new_temp(&leaf, Some(parent));
        parent_inode.iops.mkdir(&parent_inode, &child, mode)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let (_mount, parent, leaf) = self.lookup_parent(path)?;
        if leaf.is_empty() {
            return Err(FsError::Invalid);
        }
        let parent_inode = parent.inode().ok_or(FsError::NotFound)?;
        if !parent_inode.is_dir() {
            return Err(FsError::NotDir);
        }
        parent_inode.iops.unlink(&parent_inode, &leaf)
    }

    /// Read a whole file into a buffer sized from its stat size.
    pub fn read_to_vec(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.open(path, OpenFlags::RDONLY, 0)?;
        let st = file.stat()?;
        let mut buf = alloc::vec![0u8; st.size as usize];
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static INITFS: initfs::InitFsType = initfs::InitFsType;
    static DEVFS: devfs::DevFsType = devfs::DevFsType;

    fn fresh_vfs() -> Vfs {
        let v = Vfs::new();
        v.register_fs(&INITFS).unwrap();
        v.register_fs(&DEVFS).unwrap();
        v.mount("initfs", None, "/", 0).unwrap();
        v
    }

    #[test]
    fn duplicate_fs_type_rejected() {
        let v = Vfs::new();
        v.register_fs(&INITFS).unwrap();
        assert_eq!(v.register_fs(&INITFS), Err(FsError::Exists));
    }

    #[test]
    fn mount_before_root_requires_slash_target() {
        let v = Vfs::new();
        v.register_fs(&INITFS).unwrap();
        // No root yet: mounting elsewhere cannot resolve.
        assert!(v.mount("initfs", None, "/mnt", 0).is_err());
        v.mount("initfs", None, "/", 0).unwrap();
    }

    #[test]
    fn mkdir_then_lookup_is_idempotent() {
        let v = fresh_vfs();
        v.mkdir("/dev", 0o755).unwrap();

        let first = v.lookup("/dev").unwrap();
        let second = v.lookup("/dev").unwrap();
        let (a, b) = (first.dentry.inode().unwrap(), second.dentry.inode().unwrap());
        assert!(a.same_identity(&b));
        assert!(a.is_dir());
    }

    #[test]
    fn mkdir_twice_reports_exists() {
        let v = fresh_vfs();
        v.mkdir("/tmp", 0o755).unwrap();
        assert_eq!(v.mkdir("/tmp", 0o755), Err(FsError::Exists));
    }

    #[test]
    fn lookup_missing_is_not_found() {
        let v = fresh_vfs();
        assert!(matches!(v.lookup("/nope"), Err(FsError::NotFound)));
    }

    #[test]
    fn dot_and_dotdot_resolve_at_vfs_level() {
        let v = fresh_vfs();
        v.mkdir("/dev", 0o755).unwrap();
        let via_dots = v.lookup("/dev/./../dev").unwrap();
        let direct = v.lookup("/dev").unwrap();
        assert!(via_dots
            .dentry
            .inode()
            .unwrap()
            .same_identity(&direct.dentry.inode().unwrap()));
        // .. at the global root stays at the root.
        let root = v.lookup("/..").unwrap();
        assert!(Arc::ptr_eq(&root.dentry, &v.lookup("/").unwrap().dentry));
    }

    #[test]
    fn mount_overlay_and_umount_restore() {
        let v = fresh_vfs();
        v.mkdir("/dev", 0o755).unwrap();
        let before = v.lookup("/dev").unwrap().dentry.inode().unwrap();

        v.mount("devfs", None, "/dev", 0).unwrap();
        let overlaid = v.lookup("/dev").unwrap();
        assert_eq!(overlaid.mount.sb.fs_name, "devfs");
        assert!(Arc::ptr_eq(&overlaid.dentry, &overlaid.mount.root));

        v.umount("/dev").unwrap();
        let after = v.lookup("/dev").unwrap().dentry.inode().unwrap();
        assert!(after.same_identity(&before));
    }

    #[test]
    fn overlay_on_root_replaces_resolution() {
        let v = fresh_vfs();
        v.mkdir("/marker", 0o755).unwrap();

        // Overlay a fresh initfs over "/": the old tree disappears.
        v.mount("initfs", None, "/", 0).unwrap();
        assert!(v.lookup("/marker").is_err());
        v.mkdir("/other", 0o755).unwrap();
        assert!(v.lookup("/other").is_ok());

        // Dropping the overlay restores the original tree.
        v.umount("/").unwrap();
        assert!(v.lookup("/marker").is_ok());
        assert!(v.lookup("/other").is_err());
    }

    #[test]
    fn dotdot_at_mount_root_crosses_to_mountpoint() {
        let v = fresh_vfs();
        v.mkdir("/dev", 0o755).unwrap();
        v.mkdir("/etc", 0o755).unwrap();
        v.mount("devfs", None, "/dev", 0).unwrap();

        let crossed = v.lookup("/dev/../etc").unwrap();
        let direct = v.lookup("/etc").unwrap();
        assert!(crossed
            .dentry
            .inode()
            .unwrap()
            .same_identity(&direct.dentry.inode().unwrap()));
    }

    #[test]
    fn umount_root_mount_is_busy() {
        let v = fresh_vfs();
        assert_eq!(v.umount("/"), Err(FsError::Busy));
    }

    #[test]
    fn parent_lookup_returns_leaf() {
        let v = fresh_vfs();
        v.mkdir("/dev", 0o755).unwrap();
        let (_m, parent, leaf) = v.lookup_parent("/dev/null").unwrap();
        assert_eq!(leaf, "null");
        assert_eq!(parent.name, "dev");
        // Leaf of "." or ".." is rejected.
        assert!(v.lookup_parent("/dev/..").is_err());
    }

    #[test]
    fn open_without_create_requires_existence() {
        let v = fresh_vfs();
        assert!(v.open("/missing", OpenFlags::RDONLY, 0).is_err());
    }

    #[test]
    fn generic_seek_uses_getattr_size() {
        let v = fresh_vfs();
        v.mkdir("/d", 0o755).unwrap();
        let f = v.open("/d", OpenFlags::RDONLY, 0).unwrap();
        // initfs dirs have size 0; SEEK_END+0 lands at 0.
        assert_eq!(f.seek(0, Whence::End).unwrap(), 0);
        assert_eq!(f.seek(5, Whence::Set).unwrap(), 5);
        assert_eq!(f.seek(-2, Whence::Cur).unwrap(), 3);
        assert!(f.seek(-10, Whence::Cur).is_err());
    }
}
