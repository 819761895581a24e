//! 超级块操作
//!
//! 超级块固定在块 1，记录文件系统几何信息和延迟回收 inode 列表。
//! 几何信息装载后只读；回收列表在运行期可变，由互斥锁保护，
//! 修改后立即写回设备（不经过日志）。

use core::mem;
use core::ptr;
use std::sync::{Mutex, MutexGuard};

use crate::consts::{BPB, INODESTART, NRECLAIM_INODES, SUPERBLOCK_NO};
use crate::error::{FsError, Result};

use super::bio::Bcache;
use super::inode::IPB;

/// 磁盘上的原始超级块结构。
///
/// # 内存布局
/// `#[repr(C)]` 确保与磁盘布局一致，字段按本机字节序存储。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawSuperBlock {
    /// 文件系统总块数
    pub size: u32,
    /// 数据块数量（不含元数据）
    pub nblocks: u32,
    /// inode 总数
    pub ninodes: u32,
    /// 延迟回收列表中有效表项的数量
    pub num_reclaim_inodes: u32,
    /// 下次启动时需要截断并释放的 inode 编号
    pub reclaim_inodes: [u32; NRECLAIM_INODES],
}

/// 延迟回收 inode 列表的内存副本。
pub(crate) struct ReclaimList {
    pub count: u32,
    pub inums: [u32; NRECLAIM_INODES],
}

/// 内存中的超级块。
pub(crate) struct SuperBlock {
    size: u32,
    nblocks: u32,
    ninodes: u32,
    reclaim: Mutex<ReclaimList>,
}

impl SuperBlock {
    /// 从设备读取并校验超级块。
    ///
    /// # 可能的错误
    /// 几何信息明显不合法（总块数为零、inode 表加元数据超出盘大小）时
    /// 返回 [`FsError::InvalidArg`]，表示设备上没有可装载的文件系统。
    pub(crate) fn load(bcache: &Bcache) -> Result<Self> {
        debug_assert!(mem::size_of::<RawSuperBlock>() <= crate::consts::BSIZE);

        let buf = bcache.bread(SUPERBLOCK_NO);
        let raw = unsafe { ptr::read(buf.raw_data() as *const RawSuperBlock) };
        drop(buf);

        let inode_blocks = (raw.ninodes as usize).div_ceil(IPB) as u32;
        if raw.size == 0
            || raw.ninodes == 0
            || raw.num_reclaim_inodes as usize > NRECLAIM_INODES
            || INODESTART + inode_blocks >= raw.size
        {
            return Err(FsError::InvalidArg);
        }

        Ok(Self {
            size: raw.size,
            nblocks: raw.nblocks,
            ninodes: raw.ninodes,
            reclaim: Mutex::new(ReclaimList {
                count: raw.num_reclaim_inodes,
                inums: raw.reclaim_inodes,
            }),
        })
    }

    /// 文件系统总块数。
    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    /// inode 总数。
    pub(crate) fn inode_size(&self) -> u32 {
        self.ninodes
    }

    pub(crate) fn nblocks(&self) -> u32 {
        self.nblocks
    }

    /// 定位 inode 所在的磁盘块。inode 表紧跟在超级块之后。
    pub(crate) fn locate_inode(&self, inum: u32) -> u32 {
        if inum >= self.ninodes {
            panic!(
                "query inum {} larger than maximum inode nums {}",
                inum, self.ninodes
            );
        }
        INODESTART + inum / (IPB as u32)
    }

    /// 位图区的起始块号。
    pub(crate) fn bitmap_base(&self) -> u32 {
        INODESTART + (self.ninodes as usize).div_ceil(IPB) as u32
    }

    /// 给定数据块号，返回管理该块的位图块号。
    pub(crate) fn bitmap_blockno(&self, blockno: u32) -> u32 {
        self.bitmap_base() + blockno / BPB
    }

    /// 锁住延迟回收列表。持有者可跨磁盘写入持锁。
    pub(crate) fn reclaim(&self) -> MutexGuard<'_, ReclaimList> {
        self.reclaim.lock().unwrap()
    }

    /// 把超级块（含给定的回收列表内容）立即写回设备。
    ///
    /// 回收列表的更新不经过日志；这一点与磁盘布局一致即可，
    /// 崩溃窗口内丢失的只是"提前回收"的机会，不破坏一致性。
    pub(crate) fn write_back(&self, bcache: &Bcache, reclaim: &ReclaimList) {
        let raw = RawSuperBlock {
            size: self.size,
            nblocks: self.nblocks,
            ninodes: self.ninodes,
            num_reclaim_inodes: reclaim.count,
            reclaim_inodes: reclaim.inums,
        };
        let mut buf = bcache.bread(SUPERBLOCK_NO);
        unsafe { ptr::write(buf.raw_data_mut() as *mut RawSuperBlock, raw) };
        buf.bwrite();
    }
}
