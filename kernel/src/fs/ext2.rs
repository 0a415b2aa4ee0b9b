//! ext2 — read-only on-disk filesystem.
//!
//! On mount, reads the superblock at byte offset 1024, validates the
//! 0xEF53 signature, derives the block geometry and loads the
//! block-group descriptor table. Inode reads compute the owning group
//! and slot; block mapping follows the 12 direct pointers and the
//! single, double and triple indirect chains, one block read per level.
//! A block number of zero is treated as end-of-file, covering both
//! holes and truncated chains.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{
    mode, Dentry, DirEntry, File, FileOps, FsError, FsType, Inode, InodeOps, Result, Stat,
    Superblock,
};
use crate::block::BlockDevice;

pub const EXT2_SIGNATURE: u16 = 0xEF53;
pub const EXT2_ROOT_INO: u32 = 2;

const DIRECT_BLOCKS: usize = 12;
const IND_BLOCK: usize = 12;
const DIND_BLOCK: usize = 13;
const TIND_BLOCK: usize = 14;

/// Smallest legal directory record.
const DIRENT_MIN_LEN: u16 = 8;

/* ---- on-disk layouts ---- */

/// Base superblock (at byte 1024) plus the dynamic-revision extension.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RawSuperblock {
    total_inodes: u32,
    total_blocks: u32,
    su_blocks: u32,
    free_blocks: u32,
    free_inodes: u32,
    first_data_block: u32,
    log_block_size: u32,
    log_frag_size: u32,
    blocks_per_group: u32,
    frags_per_group: u32,
    inodes_per_group: u32,
    mount_time: u32,
    write_time: u32,
    mounts_since_check: u16,
    mounts_per_check: u16,
    signature: u16,
    fs_state: u16,
    error_action: u16,
    version_minor: u16,
    last_check_time: u32,
    check_interval: u32,
    creator_os: u32,
    version_major: u32,
    su_uid: u16,
    su_gid: u16,
    // Dynamic revision (version_major >= 1) fields.
    first_inode: u32,
    inode_size: u16,
    block_group_nr: u16,
    feat_compat: u32,
    feat_incompat: u32,
    feat_ro_compat: u32,
}

/// Block group descriptor (32 bytes on disk).
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RawGroupDesc {
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
    free_blocks: u16,
    free_inodes: u16,
    used_dirs: u16,
    _pad: u16,
    _reserved: [u32; 3],
}

/// On-disk inode (first 128 bytes; larger rev-1 inodes only append).
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RawInode {
    mode: u16,
    uid: u16,
    size_low: u32,
    atime: u32,
    ctime: u32,
    mtime: u32,
    dtime: u32,
    gid: u16,
    links_count: u16,
    blocks_count: u32,
    flags: u32,
    _os1: u32,
    block: [u32; 15],
    generation: u32,
    file_acl: u32,
    size_high: u32,
    faddr: u32,
    _os2: [u8; 12],
}

/// Read a packed on-disk struct out of a byte buffer.
fn read_raw<T: Copy>(bytes: &[u8]) -> T {
    assert!(bytes.len() >= core::mem::size_of::<T>());
    // SAFETY: T is a packed plain-data layout and the source holds at
    // least size_of::<T>() bytes; read_unaligned tolerates any address.
    unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) }
}

fn vfs_mode(disk_mode: u16) -> u32 {
    let file_type = match disk_mode & 0xF000 {
        0x8000 => mode::S_IFREG,
        0x4000 => mode::S_IFDIR,
        0xA000 => mode::S_IFLNK,
        0x2000 => mode::S_IFCHR,
        0x6000 => mode::S_IFBLK,
        0x1000 => mode::S_IFIFO,
        0xC000 => mode::S_IFSOCK,
        _ => 0,
    };
    file_type | (disk_mode as u32 & 0o7777)
}

/* ---- per-mount state ---- */

struct Ext2Fs {
    dev: &'static BlockDevice,
    block_size: u32,
    inodes_per_group: u32,
    inode_size: u32,
    #[allow(dead_code)]
    first_inode: u32,
    num_groups: u32,
    bgdt: Vec<RawGroupDesc>,
}

impl Ext2Fs {
    fn read_block(&self, blkno: u32, buf: &mut [u8]) -> Result<()> {
        let spb = self.block_size / self.dev.sector_size();
        self.dev
            .read(blkno as u64 * spb as u64, spb, buf)
            .map_err(|_| FsError::Io)
    }

    fn block_buf(&self) -> Vec<u8> {
        vec![0u8; self.block_size as usize]
    }

    fn read_inode(&self, ino: u32) -> Result<RawInode> {
        if ino == 0 {
            return Err(FsError::Invalid);
        }
        let group = (ino - 1) / self.inodes_per_group;
        let index = (ino - 1) % self.inodes_per_group;
        let desc = self.bgdt.get(group as usize).ok_or(FsError::Invalid)?;

        let byte_off = index * self.inode_size;
        let block = desc.inode_table + byte_off / self.block_size;
        let off_in_block = (byte_off % self.block_size) as usize;

        let mut buf = self.block_buf();
        self.read_block(block, &mut buf)?;
        Ok(read_raw::<RawInode>(&buf[off_in_block..]))
    }

    /// Map a logical block number to its on-disk block. Returns 0 at a
    /// hole or past the allocated chain; callers treat 0 as end-of-file.
    fn block_map(&self, inode: &RawInode, lbn: u32) -> Result<u32> {
        let ptrs = self.block_size / 4;
        let mut lbn = lbn;

        if (lbn as usize) < DIRECT_BLOCKS {
            return Ok(inode.block[lbn as usize]);
        }
        lbn -= DIRECT_BLOCKS as u32;

        let read_entry = |table_block: u32, index: u32| -> Result<u32> {
            if table_block == 0 {
                return Ok(0);
            }
            let mut buf = self.block_buf();
            self.read_block(table_block, &mut buf)?;
            let at = index as usize * 4;
            Ok(u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()))
        };

        // Singly indirect.
        if lbn < ptrs {
            return read_entry(inode.block[IND_BLOCK], lbn);
        }
        lbn -= ptrs;

        // Doubly indirect.
        if lbn < ptrs * ptrs {
            let l1 = read_entry(inode.block[DIND_BLOCK], lbn / ptrs)?;
            return read_entry(l1, lbn % ptrs);
        }
        lbn -= ptrs * ptrs;

        // Triply indirect.
        let l1 = read_entry(inode.block[TIND_BLOCK], lbn / (ptrs * ptrs))?;
        let l2 = read_entry(l1, (lbn / ptrs) % ptrs)?;
        read_entry(l2, lbn % ptrs)
    }

    fn make_inode(self: &Arc<Self>, sb: &Arc<Superblock>, ino: u32, disk: RawInode) -> Arc<Inode> {
        let node = Arc::new(Ext2Node {
            fs: self.clone(),
            disk,
        });
        Inode::new(ino as u64, vfs_mode(disk.mode), sb.clone(), node.clone(), node)
    }
}

fn file_size(disk: &RawInode) -> u64 {
    disk.size_low as u64 | ((disk.size_high as u64) << 32)
}

/* ---- inode + file ops ---- */

/// One resolved ext2 inode: the fs handle plus a copy of the on-disk
/// inode. Serves as both the inode-ops and file-ops object.
struct Ext2Node {
    fs: Arc<Ext2Fs>,
    disk: RawInode,
}

impl Ext2Node {
    /// Walk the directory data of this inode, calling `visit` for each
    /// live record: (byte offset of the next record, ino, type, name).
    fn scan_dir(
        &self,
        mut offset: u32,
        mut visit: impl FnMut(u32, u32, u8, &[u8]) -> bool,
    ) -> Result<()> {
        let dir_size = file_size(&self.disk) as u32;
        let mut buf = self.fs.block_buf();
        let mut cur_block = u32::MAX;

        while offset < dir_size {
            let lbn = offset / self.fs.block_size;
            let in_block = (offset % self.fs.block_size) as usize;

            if lbn != cur_block {
                let phys = self.fs.block_map(&self.disk, lbn)?;
                if phys == 0 {
                    break;
                }
                self.fs.read_block(phys, &mut buf)?;
                cur_block = lbn;
            }

            if in_block + DIRENT_MIN_LEN as usize > buf.len() {
                break;
            }
            let ino = u32::from_le_bytes(buf[in_block..in_block + 4].try_into().unwrap());
            let rec_len =
                u16::from_le_bytes(buf[in_block + 4..in_block + 6].try_into().unwrap());
            let name_len = buf[in_block + 6] as usize;
            let file_type = buf[in_block + 7];

            if rec_len < DIRENT_MIN_LEN {
                break; // corrupt chain
            }

            let name_end = (in_block + 8 + name_len).min(buf.len());
            let name = &buf[in_block + 8..name_end];
            offset += rec_len as u32;

            if ino != 0 && !visit(offset, ino, file_type, name) {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl InodeOps for Ext2Node {
    fn lookup(&self, dir: &Inode, child: &Dentry) -> Result<()> {
        if !dir.is_dir() {
            return Err(FsError::NotDir);
        }
        let mut found_ino = 0u32;
        self.scan_dir(0, |_next, ino, _ft, name| {
            if name == child.name.as_bytes() {
                found_ino = ino;
                return false;
            }
            true
        })?;
        if found_ino == 0 {
            return Err(FsError::NotFound);
        }
        let disk = self.fs.read_inode(found_ino)?;
        child.set_inode(self.fs.make_inode(&dir.sb, found_ino, disk));
        Ok(())
    }

    fn getattr(&self, inode: &Inode) -> Result<Stat> {
        Ok(Stat {
            ino: inode.ino,
            mode: inode.mode,
            nlink: self.disk.links_count as u32,
            uid: self.disk.uid as u32,
            gid: self.disk.gid as u32,
            size: file_size(&self.disk),
            blocks: self.disk.blocks_count as u64,
            atime: self.disk.atime as u64,
            mtime: self.disk.mtime as u64,
            ctime: self.disk.ctime as u64,
        })
    }
}

impl FileOps for Ext2Node {
    fn read(&self, _file: &File, buf: &mut [u8], pos: &mut u64) -> Result<usize> {
        let size = file_size(&self.disk);
        if *pos >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - *pos) as usize;

        let mut block_buf = self.fs.block_buf();
        let mut cur_block = u32::MAX;
        let mut done = 0usize;

        while done < want {
            let at = *pos + done as u64;
            let lbn = (at / self.fs.block_size as u64) as u32;
            let in_block = (at % self.fs.block_size as u64) as usize;
            let chunk = (self.fs.block_size as usize - in_block).min(want - done);

            if lbn != cur_block {
                let phys = self.fs.block_map(&self.disk, lbn)?;
                if phys == 0 {
                    break; // hole or truncated chain: end-of-file
                }
                self.fs.read_block(phys, &mut block_buf)?;
                cur_block = lbn;
            }

            buf[done..done + chunk].copy_from_slice(&block_buf[in_block..in_block + chunk]);
            done += chunk;
        }

        *pos += done as u64;
        Ok(done)
    }

    /// One record per call; the offset advances to the next record
    /// start. End-of-directory reports no entry.
    fn readdir(&self, _file: &File, pos: &mut u64) -> Result<Option<DirEntry>> {
        let mut out = None;
        let mut next_pos = *pos;
        self.scan_dir(*pos as u32, |next, ino, file_type, name| {
            next_pos = next as u64;
            out = Some(DirEntry {
                ino: ino as u64,
                dtype: file_type,
                name: core::str::from_utf8(name)
                    .unwrap_or("?")
                    .into(),
            });
            false
        })?;
        if out.is_some() {
            *pos = next_pos;
        }
        Ok(out)
    }
}

/* ---- mount ---- */

pub struct Ext2FsType;

impl FsType for Ext2FsType {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn mount(&self, device: Option<&'static BlockDevice>, flags: u32) -> Result<Arc<Superblock>> {
        let dev = device.ok_or(FsError::Invalid)?;
        let ss = dev.sector_size();

        // The superblock lives at byte 1024 regardless of geometry.
        let sb_lba = 1024 / ss;
        let sb_off = (1024 - sb_lba * ss) as usize;
        let sb_sectors = ((sb_off as u32 + 1024).div_ceil(ss)).max(1);
        let mut raw = vec![0u8; (sb_sectors * ss) as usize];
        dev.read(sb_lba as u64, sb_sectors, &mut raw)
            .map_err(|_| FsError::Io)?;

        let dsb = read_raw::<RawSuperblock>(&raw[sb_off..]);
        if dsb.signature != EXT2_SIGNATURE {
            log::error!(target: "ext2", "bad signature {:#06x}", { dsb.signature });
            return Err(FsError::Invalid);
        }

        let block_size = 1024u32 << dsb.log_block_size;
        let (inode_size, first_inode) = if dsb.version_major >= 1 {
            (dsb.inode_size as u32, dsb.first_inode)
        } else {
            (128, 11)
        };
        let num_groups = dsb.total_blocks.div_ceil(dsb.blocks_per_group);

        let mut fs = Ext2Fs {
            dev,
            block_size,
            inodes_per_group: dsb.inodes_per_group,
            inode_size,
            first_inode,
            num_groups,
            bgdt: Vec::new(),
        };

        // The descriptor table sits in the block after the superblock.
        let bgdt_block = if block_size == 1024 { 2 } else { 1 };
        let bgdt_bytes = num_groups as usize * core::mem::size_of::<RawGroupDesc>();
        let bgdt_blocks = bgdt_bytes.div_ceil(block_size as usize);

        let mut table = vec![0u8; bgdt_blocks * block_size as usize];
        for i in 0..bgdt_blocks {
            let at = i * block_size as usize;
            fs.read_block(
                bgdt_block + i as u32,
                &mut table[at..at + block_size as usize],
            )?;
        }
        fs.bgdt = (0..num_groups as usize)
            .map(|g| read_raw::<RawGroupDesc>(&table[g * 32..]))
            .collect();

        let fs = Arc::new(fs);
        let sb = Superblock::new("ext2", flags);
        let root_disk = fs.read_inode(EXT2_ROOT_INO)?;
        let root_inode = fs.make_inode(&sb, EXT2_ROOT_INO, root_disk);
        sb.set_root(Dentry::new_root(root_inode));

        log::info!(
            target: "ext2",
            "mounted: block_size={} groups={}",
            block_size,
            num_groups
        );
        Ok(sb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::testutil::mem_device;
    use crate::fs::{OpenFlags, Vfs};

    const BLOCK: usize = 1024;

    fn put_u16(img: &mut [u8], at: usize, v: u16) {
        img[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(img: &mut [u8], at: usize, v: u32) {
        img[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Image layout (1 KiB blocks):
    ///   block 1      superblock
    ///   block 2      group descriptor table (one group)
    ///   blocks 5..9  inode table (32 inodes * 128 B)
    ///   block 10     root directory data
    ///   blocks 11..  "hello.txt" data: 12 direct + indirect table + 2
    ///   block 26     "notes" data
    fn build_image() -> (Vec<u8>, Vec<u8>) {
        let mut img = vec![0u8; 64 * 1024];

        // Superblock at byte 1024.
        let sb = BLOCK;
        put_u32(&mut img, sb, 32); // total inodes
        put_u32(&mut img, sb + 4, 64); // total blocks
        put_u32(&mut img, sb + 24, 0); // log block size -> 1024
        put_u32(&mut img, sb + 32, 8192); // blocks per group
        put_u32(&mut img, sb + 40, 32); // inodes per group
        put_u16(&mut img, sb + 56, EXT2_SIGNATURE);
        put_u32(&mut img, sb + 76, 1); // rev level: dynamic
        put_u32(&mut img, sb + 84, 11); // first inode
        put_u16(&mut img, sb + 88, 128); // inode size

        // One group descriptor: inode table at block 5.
        let gd = 2 * BLOCK;
        put_u32(&mut img, gd, 3); // block bitmap
        put_u32(&mut img, gd + 4, 4); // inode bitmap
        put_u32(&mut img, gd + 8, 5); // inode table

        let inode_at = |ino: u32| 5 * BLOCK + (ino as usize - 1) * 128;

        // Root inode (2): directory, one data block at 10.
        let root = inode_at(EXT2_ROOT_INO);
        put_u16(&mut img, root, 0x41ED); // drwxr-xr-x
        put_u32(&mut img, root + 4, BLOCK as u32); // size
        put_u16(&mut img, root + 26, 3); // links
        put_u32(&mut img, root + 40, 10); // block[0]

        // hello.txt (ino 12): 14000 bytes = 12 direct + 2 via indirect.
        let hello: Vec<u8> = (0..14000u32).map(|i| ((i * 7 + 3) % 251) as u8).collect();
        let file = inode_at(12);
        put_u16(&mut img, file, 0x81A4); // -rw-r--r--
        put_u32(&mut img, file + 4, hello.len() as u32);
        put_u16(&mut img, file + 26, 1);
        for d in 0..12u32 {
            put_u32(&mut img, file + 40 + d as usize * 4, 11 + d);
        }
        put_u32(&mut img, file + 40 + 12 * 4, 23); // single indirect table
        put_u32(&mut img, 23 * BLOCK, 24);
        put_u32(&mut img, 23 * BLOCK + 4, 25);
        for (i, chunk) in hello.chunks(BLOCK).enumerate() {
            let blk = if i < 12 { 11 + i } else { 24 + (i - 12) };
            img[blk * BLOCK..blk * BLOCK + chunk.len()].copy_from_slice(chunk);
        }

        // notes (ino 13): small file in block 26.
        let notes = b"remember the milk\n";
        let nfile = inode_at(13);
        put_u16(&mut img, nfile, 0x81A4);
        put_u32(&mut img, nfile + 4, notes.len() as u32);
        put_u16(&mut img, nfile + 26, 1);
        put_u32(&mut img, nfile + 40, 26);
        img[26 * BLOCK..26 * BLOCK + notes.len()].copy_from_slice(notes);

        // Root directory data: ".", "..", "hello.txt", "notes".
        let dir = 10 * BLOCK;
        let mut at = dir;
        let mut entry = |img: &mut [u8],
                         at: &mut usize,
                         ino: u32,
                         ftype: u8,
                         name: &[u8],
                         rec_len: u16| {
            put_u32(img, *at, ino);
            put_u16(img, *at + 4, rec_len);
            img[*at + 6] = name.len() as u8;
            img[*at + 7] = ftype;
            img[*at + 8..*at + 8 + name.len()].copy_from_slice(name);
            *at += rec_len as usize;
        };
        entry(&mut img, &mut at, 2, 2, b".", 12);
        entry(&mut img, &mut at, 2, 2, b"..", 12);
        entry(&mut img, &mut at, 12, 1, b"hello.txt", 20);
        let rest = (dir + BLOCK - at) as u16;
        entry(&mut img, &mut at, 13, 1, b"notes", rest);

        (img, hello)
    }

    fn mounted(img: Vec<u8>, name: &str) -> Vfs {
        static EXT2: Ext2FsType = Ext2FsType;
        static INITFS: crate::fs::initfs::InitFsType = crate::fs::initfs::InitFsType;
        let dev = mem_device(name, 512, img);
        let v = Vfs::new();
        v.register_fs(&INITFS).unwrap();
        v.register_fs(&EXT2).unwrap();
        v.mount("initfs", None, "/", 0).unwrap();
        v.mount("ext2", Some(dev), "/", 0).unwrap();
        v
    }

    #[test]
    fn mount_overlays_root_and_stats_files() {
        let (img, hello) = build_image();
        let v = mounted(img, "ext2a");

        let st = v.stat("/hello.txt").unwrap();
        assert_eq!(st.size, hello.len() as u64);
        assert!(mode::is_reg(st.mode));
        assert_eq!(st.ino, 12);

        let root = v.stat("/").unwrap();
        assert!(mode::is_dir(root.mode));
    }

    #[test]
    fn bad_signature_fails_mount() {
        let (mut img, _) = build_image();
        put_u16(&mut img, BLOCK + 56, 0xBEEF);
        static EXT2: Ext2FsType = Ext2FsType;
        let dev = mem_device("ext2bad", 512, img);
        let v = Vfs::new();
        v.register_fs(&EXT2).unwrap();
        assert!(v.mount("ext2", Some(dev), "/", 0).is_err());
    }

    #[test]
    fn whole_file_read_crosses_indirect_chain() {
        let (img, hello) = build_image();
        let v = mounted(img, "ext2b");
        let data = v.read_to_vec("/hello.txt").unwrap();
        assert_eq!(data, hello);
    }

    #[test]
    fn chunked_reads_equal_single_read() {
        let (img, hello) = build_image();
        let v = mounted(img, "ext2c");

        for chunk in [7usize, 100, 1000, 1024, 4096] {
            let f = v.open("/hello.txt", OpenFlags::RDONLY, 0).unwrap();
            let mut got = Vec::new();
            let mut buf = vec![0u8; chunk];
            loop {
                let n = f.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }
            assert_eq!(got, hello, "chunk size {}", chunk);
        }
    }

    #[test]
    fn readdir_yields_each_entry_once() {
        let (img, _) = build_image();
        let v = mounted(img, "ext2d");

        let dir = v.open("/", OpenFlags::RDONLY, 0).unwrap();
        let mut names = Vec::new();
        while let Some(e) = dir.readdir().unwrap() {
            names.push(e.name);
        }
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), names.len(), "duplicates in {:?}", names);
        for want in [".", "..", "hello.txt", "notes"] {
            assert!(names.iter().any(|n| n == want), "missing {}", want);
        }
    }

    #[test]
    fn lookup_missing_entry_not_found() {
        let (img, _) = build_image();
        let v = mounted(img, "ext2e");
        assert!(matches!(v.lookup("/absent"), Err(FsError::NotFound)));
    }

    #[test]
    fn small_file_reads_exactly() {
        let (img, _) = build_image();
        let v = mounted(img, "ext2f");
        let data = v.read_to_vec("/notes").unwrap();
        assert_eq!(data, b"remember the milk\n");
    }
}
