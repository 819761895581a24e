//! 块分配器
//!
//! 空闲位以两种形式各保存一份：按块号索引的稠密位向量（O(1) 释放），
//! 以及只含空闲块的链表（O(1) 分配）。链表由一把自旋锁保护；
//! 每个位另有自己的写锁，翻转位时不必持有链表锁。
//!
//! 锁顺序：释放路径先取位锁、放掉之后再取链表锁，与分配路径
//! （链表锁内取位锁）之间不存在环路等待。
//!
//! 位图在磁盘上的更新只通过事务进行：分配与释放在提交前由
//! [`balloc_free_on_disk`] 折叠成位图块更新；事务提交后，释放的块
//! 才由调用方归还到内存空闲链表（两阶段释放）。

use std::collections::VecDeque;

use bit_field::BitField;
use spin::Mutex as SpinLock;

use crate::consts::{BPB, BSIZE};
use crate::error::{FsError, Result};

use super::transaction::Transaction;
use super::ScaleFs;

/// 一个数据块的空闲位，写锁即锁本身。
struct FreeBit {
    free: SpinLock<bool>,
}

/// 内存中的空闲块集合。
pub(crate) struct BlockAllocator {
    /// 按块号索引的位视图。
    bits: Vec<FreeBit>,
    /// 只包含空闲块号的链表视图。
    freelist: SpinLock<VecDeque<u32>>,
}

impl BlockAllocator {
    /// 启动时从磁盘位图构建空闲位向量与空闲链表。
    ///
    /// 必须在日志回放完成之后调用：回放的事务可能包含对位图块的更新。
    pub(crate) fn initialize(fs: &ScaleFs) -> Self {
        let size = fs.sb.size();
        let mut bits = Vec::with_capacity(size as usize);
        let mut freelist = VecDeque::new();

        for base in (0..size).step_by(BPB as usize) {
            let buf = fs.bcache.bread(fs.sb.bitmap_blockno(base));
            let data = buf.data();
            let nbits = BPB.min(size - base);
            for bi in 0..nbits {
                let used = data[(bi / 8) as usize].get_bit((bi % 8) as usize);
                bits.push(FreeBit {
                    free: SpinLock::new(!used),
                });
                if !used {
                    freelist.push_back(base + bi);
                }
            }
        }

        log::info!(
            "balloc: {} free of {} blocks",
            freelist.len(),
            bits.len()
        );
        Self {
            bits,
            freelist: SpinLock::new(freelist),
        }
    }

    /// 分配一个空闲块。
    ///
    /// # 功能说明
    /// 从空闲链表头部弹出一个块号，并在该位的写锁下把位视图翻为已用。
    /// 只修改内存中的空闲集合；磁盘位图的更新推迟到事务提交时。
    ///
    /// # 可能的错误
    /// 链表为空时返回 [`FsError::OutOfBlocks`]；
    /// 链表与位视图不一致（弹出的块在位视图中已是已用）是致命错误。
    pub(crate) fn alloc_block(&self) -> Result<u32> {
        let mut list = self.freelist.lock();
        if let Some(bno) = list.pop_front() {
            let mut bit = self.bits[bno as usize].free.lock();
            assert!(*bit, "balloc: free list holds a used block {}", bno);
            *bit = false;
            return Ok(bno);
        }
        Err(FsError::OutOfBlocks)
    }

    /// 把一个块标记为空闲并归还给空闲链表。
    ///
    /// 先在位的写锁下翻转位视图，释放位锁之后再取链表锁入队，
    /// 避免与 [`Self::alloc_block`] 形成 ABBA 死锁。
    pub(crate) fn free_block(&self, bno: u32) {
        {
            let mut bit = self.bits[bno as usize].free.lock();
            if *bit {
                panic!("balloc: freeing free block {}", bno);
            }
            *bit = true;
        }
        self.freelist.lock().push_front(bno);
    }

    /// 当前空闲块数量的近似快照。
    pub(crate) fn free_count(&self) -> usize {
        self.bits.iter().filter(|b| *b.free.lock()).count()
    }

    pub(crate) fn total(&self) -> usize {
        self.bits.len()
    }
}

/// 把一批块在磁盘位图中标记为已分配（`alloc == true`）或空闲。
///
/// # 功能说明
/// 块号升序排序后按位图块分组，同一位图块内的所有位翻转合并为
/// 一次更新，整块追加进事务。一致性检查失败（重复分配已用块、
/// 重复释放空闲块）是致命错误。
pub(crate) fn balloc_free_on_disk(
    fs: &ScaleFs,
    blocks: &mut Vec<u32>,
    tr: &mut Transaction,
    alloc: bool,
) {
    blocks.sort_unstable();

    let mut i = 0;
    while i < blocks.len() {
        let bm_blockno = fs.sb.bitmap_blockno(blocks[i]);
        let mut buf = fs.bcache.bread(bm_blockno);
        // 本位图块所能表示的最大块号，用于合并落在同一块中的更新
        let max_bno = blocks[i] | (BPB - 1);

        while i < blocks.len() && blocks[i] <= max_bno {
            let bi = (blocks[i] % BPB) as usize;
            let byte = &mut buf.data_mut()[bi / 8];
            if alloc {
                if byte.get_bit(bi % 8) {
                    panic!("balloc_free_on_disk: block {} already in use", blocks[i]);
                }
                byte.set_bit(bi % 8, true);
            } else {
                if !byte.get_bit(bi % 8) {
                    panic!("balloc_free_on_disk: block {} already free", blocks[i]);
                }
                byte.set_bit(bi % 8, false);
            }
            i += 1;
        }

        tr.add_buf_unique(&buf);
    }
}

/// 分配一个数据块，记入事务的分配列表，需要时清零。
///
/// 只改动内存空闲集合；对应的位图更新在事务提交时折叠进来。
pub(crate) fn balloc(
    fs: &ScaleFs,
    mut tr: Option<&mut Transaction>,
    zero_on_alloc: bool,
) -> Result<u32> {
    let bno = fs.balloc().alloc_block()?;
    if let Some(tr) = tr.as_deref_mut() {
        tr.add_allocated_block(bno);
    }
    if zero_on_alloc {
        bzero(fs, bno, false);
    }
    Ok(bno)
}

/// 释放一个数据块。
///
/// `delayed_free == true` 时块暂不归还内存空闲链表，只记入事务的
/// 释放列表，等事务提交后再归还——保证未持久化的释放不会被复用。
pub(crate) fn bfree(fs: &ScaleFs, bno: u32, tr: Option<&mut Transaction>, delayed_free: bool) {
    if !delayed_free {
        fs.balloc().free_block(bno);
    }
    if let Some(tr) = tr {
        tr.add_free_block(bno);
    }
}

/// 清零一个块在缓存中的内容；`writeback` 为真时立即写回设备。
pub(crate) fn bzero(fs: &ScaleFs, bno: u32, writeback: bool) {
    let mut buf = fs.bcache.bread_for_overwrite(bno);
    buf.data_mut().copy_from_slice(&[0; BSIZE]);
    if writeback {
        buf.bwrite();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(nfree: u32) -> BlockAllocator {
        let mut bits = Vec::new();
        let mut freelist = VecDeque::new();
        for bno in 0..nfree {
            bits.push(FreeBit {
                free: SpinLock::new(true),
            });
            freelist.push_back(bno);
        }
        BlockAllocator {
            bits,
            freelist: SpinLock::new(freelist),
        }
    }

    #[test]
    fn alloc_until_exhausted() {
        let a = allocator(4);
        for _ in 0..4 {
            a.alloc_block().unwrap();
        }
        assert_eq!(a.alloc_block(), Err(FsError::OutOfBlocks));
        assert_eq!(a.free_count(), 0);
    }

    #[test]
    fn free_then_realloc() {
        let a = allocator(2);
        let b0 = a.alloc_block().unwrap();
        let b1 = a.alloc_block().unwrap();
        a.free_block(b0);
        assert_eq!(a.alloc_block().unwrap(), b0);
        a.free_block(b1);
        a.free_block(b0);
        assert_eq!(a.free_count(), 2);
    }

    #[test]
    #[should_panic(expected = "freeing free block")]
    fn double_free_is_fatal() {
        let a = allocator(2);
        let b = a.alloc_block().unwrap();
        a.free_block(b);
        a.free_block(b);
    }

    #[test]
    fn allocator_law_partition() {
        // 空闲链表与已用集合不相交，并集覆盖整个地址空间
        let a = allocator(16);
        let mut used = Vec::new();
        for _ in 0..7 {
            used.push(a.alloc_block().unwrap());
        }
        let free = a.freelist.lock().clone();
        for b in &used {
            assert!(!free.contains(b));
        }
        assert_eq!(free.len() + used.len(), a.total());
    }
}
