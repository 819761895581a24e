//! 子事务
//!
//! 一个子事务收集一次元数据操作（或一对重命名半操作）产生的全部块更新，
//! 以及本次操作分配、释放的块号。块更新保存的是加入事务那一刻的内容
//! 快照；同一块的多个版本在提交前按"后写者胜"去重。
//!
//! 释放的块遵循两阶段约定：先进入 `free_blocks`，等事务在日志中提交后
//! 才归还给内存中的空闲链表，避免尚未持久化的释放被重新分配。

use crate::consts::BSIZE;

use super::bio::{Bcache, Buf};

/// 事务中一个磁盘块的内容快照。
pub(crate) struct DiskBlock {
    pub blockno: u32,
    pub data: Box<[u8; BSIZE]>,
}

impl DiskBlock {
    pub(crate) fn new(blockno: u32, data: &[u8; BSIZE]) -> Self {
        Self {
            blockno,
            data: Box::new(*data),
        }
    }
}

/// 由应用一次操作产生的块更新集合。
pub(crate) struct Transaction {
    /// 线性化时间戳；聚合用的临时事务为 0。
    pub timestamp: u64,
    blocks: Vec<DiskBlock>,
    allocated_blocks: Vec<u32>,
    free_blocks: Vec<u32>,
    /// 随快照钉在缓冲区缓存里的块号，提交后逐一解除。
    pinned_blocks: Vec<u32>,
}

impl Transaction {
    pub(crate) fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            blocks: Vec::new(),
            allocated_blocks: Vec::new(),
            free_blocks: Vec::new(),
            pinned_blocks: Vec::new(),
        }
    }

    /// 把一个缓冲块的当前内容快照进事务，并把它钉在缓存里直到
    /// 事务提交。进过事务的块在提交前被逐出再读会读到旧内容，
    /// 钉住排除了这种可能。
    pub(crate) fn add_buf_unique(&mut self, buf: &Buf<'_>) {
        buf.pin();
        self.pinned_blocks.push(buf.read_blockno());
        let data = *buf.data();
        self.add_unique_block(buf.read_blockno(), &data);
    }

    /// 解除本事务钉住的所有缓冲块。提交后（或临时事务写出后）调用。
    pub(crate) fn unpin_all(&mut self, bcache: &Bcache) {
        for bno in self.pinned_blocks.drain(..) {
            bcache.unpin(bno);
        }
    }

    /// 追加或替换一个块内容快照：同一块号只保留最新版本。
    pub(crate) fn add_unique_block(&mut self, blockno: u32, data: &[u8; BSIZE]) {
        if let Some(b) = self.blocks.iter_mut().find(|b| b.blockno == blockno) {
            b.data.copy_from_slice(data);
        } else {
            self.blocks.push(DiskBlock::new(blockno, data));
        }
    }

    /// 把另一组块快照整体并入本事务（用于聚合多个子事务）。
    pub(crate) fn add_blocks(&mut self, blocks: Vec<DiskBlock>) {
        self.blocks.extend(blocks);
    }

    /// 取出全部块快照，事务中的分配/释放列表保持不变。
    pub(crate) fn take_blocks(&mut self) -> Vec<DiskBlock> {
        core::mem::take(&mut self.blocks)
    }

    pub(crate) fn blocks(&self) -> &[DiskBlock] {
        &self.blocks
    }

    pub(crate) fn add_allocated_block(&mut self, blockno: u32) {
        self.allocated_blocks.push(blockno);
    }

    pub(crate) fn add_free_block(&mut self, blockno: u32) {
        self.free_blocks.push(blockno);
    }

    pub(crate) fn allocated_blocks(&mut self) -> &mut Vec<u32> {
        &mut self.allocated_blocks
    }

    pub(crate) fn free_blocks(&mut self) -> &mut Vec<u32> {
        &mut self.free_blocks
    }

    pub(crate) fn freed(&self) -> &[u32] {
        &self.free_blocks
    }

    /// 同一块号保留时间戳序中最后写入的版本，维持首次出现的相对顺序。
    ///
    /// 子事务按时间戳顺序并入，因此"最后出现"即"最新内容"。
    pub(crate) fn deduplicate_blocks(&mut self) {
        let mut deduped: Vec<DiskBlock> = Vec::with_capacity(self.blocks.len());
        for b in self.blocks.drain(..) {
            if let Some(prev) = deduped.iter_mut().find(|p| p.blockno == b.blockno) {
                prev.data = b.data;
            } else {
                deduped.push(b);
            }
        }
        self.blocks = deduped;
    }

    /// 把事务内的块快照写到它们在设备上的原始位置。
    ///
    /// 既用于把日志文件自身的块落盘，也用于恢复时把已提交的事务
    /// 回放到原始位置；写入经过缓冲区缓存，保证缓存内容同步更新。
    pub(crate) fn write_to_disk(&self, bcache: &Bcache) {
        for b in &self.blocks {
            let mut buf = bcache.bread_for_overwrite(b.blockno);
            buf.data_mut().copy_from_slice(&b.data[..]);
            buf.bwrite();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(v: u8) -> [u8; BSIZE] {
        [v; BSIZE]
    }

    #[test]
    fn dedup_keeps_last_version() {
        let mut tr = Transaction::new(1);
        tr.add_blocks(vec![
            DiskBlock::new(7, &block(1)),
            DiskBlock::new(9, &block(2)),
            DiskBlock::new(7, &block(3)),
        ]);
        tr.deduplicate_blocks();

        assert_eq!(tr.blocks().len(), 2);
        assert_eq!(tr.blocks()[0].blockno, 7);
        assert_eq!(tr.blocks()[0].data[0], 3);
        assert_eq!(tr.blocks()[1].blockno, 9);
    }

    #[test]
    fn unique_block_replaces_in_place() {
        let mut tr = Transaction::new(1);
        tr.add_unique_block(4, &block(1));
        tr.add_unique_block(4, &block(9));
        assert_eq!(tr.blocks().len(), 1);
        assert_eq!(tr.blocks()[0].data[0], 9);
    }
}
