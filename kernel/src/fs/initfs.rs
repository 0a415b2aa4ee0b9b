//! initfs — minimal in-memory root filesystem.
//!
//! Supports directories only, in a flat name table: enough to make the
//! root always mountable and to create mountpoints such as `/dev`
//! before any disk is available.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use super::{mode, Dentry, FsError, FsType, Inode, InodeOps, NoFileOps, Result, Stat, Superblock};

const MAX_DIRS: usize = 8;
const ROOT_INO: u64 = 1;

struct InitDir {
    name: String,
    ino: u64,
}

/// One mounted initfs instance: a flat table of directory names.
struct InitFs {
    dirs: RwLock<Vec<InitDir>>,
    next_ino: AtomicU64,
}

impl InitFs {
    /// All directory inodes of an instance dispatch into the same flat
    /// table, so ops objects are interchangeable.
    fn dir_inode(self: &Arc<Self>, sb: &Arc<Superblock>, ino: u64) -> Arc<Inode> {
        Inode::new(
            ino,
            mode::S_IFDIR | 0o755,
            sb.clone(),
            Arc::new(InitFsDirOps { fs: self.clone() }),
            Arc::new(NoFileOps),
        )
    }
}

struct InitFsDirOps {
    fs: Arc<InitFs>,
}

impl InodeOps for InitFsDirOps {
    fn lookup(&self, dir: &Inode, child: &Dentry) -> Result<()> {
        let dirs = self.fs.dirs.read();
        match dirs.iter().find(|d| d.name == child.name) {
            Some(d) => {
                child.set_inode(self.fs.dir_inode(&dir.sb, d.ino));
                Ok(())
            }
            None => Err(FsError::NotFound),
        }
    }

    fn mkdir(&self, dir: &Inode, child: &Dentry, _mode: u32) -> Result<()> {
        let mut dirs = self.fs.dirs.write();
        if dirs.iter().any(|d| d.name == child.name) {
            return Err(FsError::Exists);
        }
        if dirs.len() >= MAX_DIRS {
            return Err(FsError::NoMemory);
        }
        let ino = self.fs.next_ino.fetch_add(1, Ordering::Relaxed);
        dirs.push(InitDir {
            name: child.name.clone(),
            ino,
        });
        child.set_inode(self.fs.dir_inode(&dir.sb, ino));
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

/// Type descriptor registered with the VFS at init.
pub struct InitFsType;

impl FsType for InitFsType {
    fn name(&self) -> &'static str {
        "initfs"
    }

    fn mount(
        &self,
        _device: Option<&'static crate::block::BlockDevice>,
        flags: u32,
    ) -> Result<Arc<Superblock>> {
        let fs = Arc::new(InitFs {
            dirs: RwLock::new(Vec::new()),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        });
        let sb = Superblock::new("initfs", flags);
        sb.set_root(Dentry::new_root(fs.dir_inode(&sb, ROOT_INO)));
        Ok(sb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Vfs;

    static INITFS: InitFsType = InitFsType;

    #[test]
    fn separate_mounts_have_separate_tables() {
        let v = Vfs::new();
        v.register_fs(&INITFS).unwrap();
        v.mount("initfs", None, "/", 0).unwrap();
        v.mkdir("/a", 0o755).unwrap();

        let w = Vfs::new();
        w.register_fs(&INITFS).unwrap();
        w.mount("initfs", None, "/", 0).unwrap();
        assert!(w.lookup("/a").is_err());
    }

    #[test]
    fn table_capacity_is_bounded() {
        let v = Vfs::new();
        v.register_fs(&INITFS).unwrap();
        v.mount("initfs", None, "/", 0).unwrap();
        for i in 0..MAX_DIRS {
            let name = alloc::format!("/d{}", i);
            v.mkdir(&name, 0o755).unwrap();
        }
        assert_eq!(v.mkdir("/overflow", 0o755), Err(FsError::NoMemory));
    }
}
