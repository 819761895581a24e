//! 镜像格式化
//!
//! 布局：块 0 保留，块 1 超级块，块 2 起 inode 表，随后是空闲位图，
//! 剩下的是数据区。格式化产物是一个只含两个对象的文件系统：
//! 根目录（inum 1）和挂在根目录下、预先铺满全部数据块的物理日志
//! 文件——日志提交路径上不允许再发生块分配。

use core::ptr;
use std::sync::Arc;

use bit_field::BitField;

use crate::block_dev::BlockDevice;
use crate::consts::{
    BPB, BSIZE, INODESTART, JOURNAL_NAME, NDIRECT, PHYS_JOURNAL_SIZE, ROOTINUM, SUPERBLOCK_NO,
};
use crate::error::{FsError, Result};

use super::dir::{DirEntry, DirName, DIRENT_SIZE};
use super::inode::{DiskInode, InodeType, IPB};
use super::superblock::RawSuperBlock;

/// 日志文件的 inode 编号（紧跟根目录分配）。
const JOURNAL_INUM: u32 = 2;

/// 格式化参数。
#[derive(Clone, Copy, Debug)]
pub struct FsGeometry {
    /// 文件系统总块数（含元数据）。
    pub total_blocks: u32,
    /// inode 表容量。
    pub ninodes: u32,
}

fn write_block(dev: &Arc<dyn BlockDevice>, bno: u32, data: &[u8; BSIZE]) -> Result<()> {
    dev.write_at(bno as u64 * BSIZE as u64, data)
}

/// 在设备上建立一个空文件系统。
///
/// # 可能的错误
/// 几何参数放不下元数据加日志文件时返回 [`FsError::InvalidArg`]
/// （目录项的 inum 字段限制 `ninodes` 不超过 `u16::MAX`）。
pub fn mkfs(dev: &Arc<dyn BlockDevice>, geo: FsGeometry) -> Result<()> {
    if geo.ninodes <= JOURNAL_INUM || geo.ninodes > u16::MAX as u32 {
        return Err(FsError::InvalidArg);
    }

    let inode_blocks = geo.ninodes.div_ceil(IPB as u32);
    let bitmap_base = INODESTART + inode_blocks;
    let bitmap_blocks = geo.total_blocks.div_ceil(BPB);
    let datastart = bitmap_base + bitmap_blocks;

    let njournal = (PHYS_JOURNAL_SIZE / BSIZE) as u32;
    let rootdir_block = datastart;
    let jindirect = datastart + 1;
    let jdata_start = datastart + 2;
    let used_end = jdata_start + njournal;

    // 留出最起码的可分配余量
    if used_end + 8 > geo.total_blocks {
        return Err(FsError::InvalidArg);
    }
    debug_assert!(njournal as usize <= NDIRECT + BSIZE / 4);

    // 元数据区与日志数据区先清零，设备可能带着残留内容
    let zero = [0u8; BSIZE];
    for bno in 1..used_end {
        write_block(dev, bno, &zero)?;
    }

    // inode 表：根目录与日志文件落在同一个表块里
    {
        let mut block = [0u8; BSIZE];
        let base = block.as_mut_ptr() as *mut DiskInode;

        let mut root = DiskInode {
            itype: InodeType::Directory as u16,
            major: 0,
            minor: 0,
            nlink: 1,
            size: (2 * DIRENT_SIZE) as u32,
            gen: 1,
            addrs: [0; NDIRECT + 2],
        };
        root.addrs[0] = rootdir_block;

        let mut journal = DiskInode {
            itype: InodeType::File as u16,
            major: 0,
            minor: 0,
            nlink: 1,
            size: PHYS_JOURNAL_SIZE as u32,
            gen: 1,
            addrs: [0; NDIRECT + 2],
        };
        for i in 0..NDIRECT {
            journal.addrs[i] = jdata_start + i as u32;
        }
        journal.addrs[NDIRECT] = jindirect;

        // 栈上的字节数组不保证 DiskInode 的对齐
        unsafe {
            ptr::write_unaligned(base.offset(ROOTINUM as isize), root);
            ptr::write_unaligned(base.offset(JOURNAL_INUM as isize), journal);
        }
        write_block(dev, INODESTART, &block)?;
    }

    // 根目录内容：".." 指向根自身，以及日志文件的目录项
    {
        let mut block = [0u8; BSIZE];
        let dotdot = DirEntry::new(ROOTINUM as u16, &DirName::dotdot());
        block[..DIRENT_SIZE].copy_from_slice(&dotdot.to_bytes());
        let jent = DirEntry::new(
            JOURNAL_INUM as u16,
            &DirName::new(JOURNAL_NAME).unwrap(),
        );
        block[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(&jent.to_bytes());
        write_block(dev, rootdir_block, &block)?;
    }

    // 日志文件的间接块：直接块放不下的那部分数据块号
    {
        let mut block = [0u8; BSIZE];
        for i in 0..(njournal as usize - NDIRECT) {
            let bno = jdata_start + NDIRECT as u32 + i as u32;
            block[i * 4..i * 4 + 4].copy_from_slice(&bno.to_ne_bytes());
        }
        write_block(dev, jindirect, &block)?;
    }

    // 空闲位图：到 used_end 为止都已占用
    for (bi, bmblock) in (bitmap_base..bitmap_base + bitmap_blocks).enumerate() {
        let mut block = [0u8; BSIZE];
        let base = bi as u32 * BPB;
        for off in 0..BPB {
            let bno = base + off;
            if bno >= used_end {
                break;
            }
            block[(off / 8) as usize].set_bit((off % 8) as usize, true);
        }
        write_block(dev, bmblock, &block)?;
    }

    // 超级块
    {
        let raw = RawSuperBlock {
            size: geo.total_blocks,
            nblocks: geo.total_blocks - datastart,
            ninodes: geo.ninodes,
            num_reclaim_inodes: 0,
            reclaim_inodes: [0; crate::consts::NRECLAIM_INODES],
        };
        let mut block = [0u8; BSIZE];
        unsafe { ptr::write_unaligned(block.as_mut_ptr() as *mut RawSuperBlock, raw) };
        write_block(dev, SUPERBLOCK_NO, &block)?;
    }

    dev.flush()?;
    log::info!(
        "mkfs: {} blocks, {} inodes, data starts at {}",
        geo.total_blocks,
        geo.ninodes,
        datastart
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_dev::MemDisk;

    #[test]
    fn rejects_undersized_geometry() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(64));
        let geo = FsGeometry {
            total_blocks: 64,
            ninodes: 16,
        };
        assert_eq!(mkfs(&dev, geo), Err(FsError::InvalidArg));
    }

    #[test]
    fn formats_and_mounts() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(4096));
        mkfs(
            &dev,
            FsGeometry {
                total_blocks: 4096,
                ninodes: 128,
            },
        )
        .unwrap();
        let fs = crate::ScaleFs::mount(dev).unwrap();
        // 根目录下只有日志文件
        let root = fs.root();
        assert!(fs.lookup(root, JOURNAL_NAME).is_ok());
        assert!(fs.lookup(root, "nonexistent").is_err());
    }
}
