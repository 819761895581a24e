//! 物理日志层
//!
//! 日志是一个预分配好的普通文件，由定长槽组成：一个扇区对齐的头部
//! `(timestamp, blocknum, kind)` 加一个数据块映像。提交协议：
//! 先写 start 头部，再写各数据槽，落盘；写 commit 头部，落盘；
//! 把数据块异步回写到原始位置并等待完成；最后在偏移 0 写零头部
//! 复位日志。单个 commit 记录终结它所在的聚合，重命名两半被打进
//! 同一个子事务，原子性由此而来。
//!
//! 一个日志事务可以聚合多个子事务（共享一对 start/commit），但绝不
//! 跨越一次冲刷：下一个子事务放不下时，先提交、应用并复位当前
//! 聚合，再以新时间戳另起炉灶——这是固定大小日志对解析器的反压。

use core::mem;

use crate::consts::{BSIZE, JHDR_SIZE, PHYS_JOURNAL_SIZE};

use super::inode::{iget, readi, writei, Inode, InodeSlot};
use super::transaction::{DiskBlock, Transaction};
use super::ScaleFs;

pub(crate) const JRNL_START: u8 = 1;
pub(crate) const JRNL_DATA: u8 = 2;
pub(crate) const JRNL_COMMIT: u8 = 3;

/// 一个日志槽占用的字节数。
const SLOT_SIZE: usize = JHDR_SIZE + BSIZE;

/// 日志槽头部。编码为小端字节序，其余部分补零到一个扇区。
pub(crate) struct JournalBlockHeader {
    pub timestamp: u64,
    pub blocknum: u32,
    pub kind: u8,
}

impl JournalBlockHeader {
    pub(crate) fn encode(&self) -> [u8; JHDR_SIZE] {
        let mut buf = [0u8; JHDR_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..12].copy_from_slice(&self.blocknum.to_le_bytes());
        buf[12] = self.kind;
        buf
    }

    pub(crate) fn decode(buf: &[u8; JHDR_SIZE]) -> Self {
        Self {
            timestamp: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            blocknum: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            kind: buf[12],
        }
    }
}

/// 物理日志的内存状态，由上下文里的日志提交锁（互斥锁）保护。
pub(crate) struct Journal {
    /// 日志文件内下一个槽的写入偏移。
    offset: u32,
    /// 已解析、等待聚合提交的子事务，按时间戳顺序排队。
    pending: Vec<Transaction>,
}

impl Journal {
    pub(crate) fn new() -> Self {
        Self {
            offset: 0,
            pending: Vec::new(),
        }
    }

    /// 把一个子事务排进待提交队列。调用者持有日志提交锁。
    pub(crate) fn add_transaction_locked(&mut self, tr: Transaction) {
        self.pending.push(tr);
    }
}

impl ScaleFs {
    fn journal_inode(&self) -> Inode {
        let inum = *self.journal_inum.get().expect("journal file not located");
        iget(self, inum)
    }

    fn dev_flush(&self) {
        if let Err(e) = self.bcache.device().flush() {
            log::error!("journal: device flush failed: {}", e);
            panic!("journal: device flush failed");
        }
    }

    /// 在当前偏移写出一个槽（头部加数据块），写入收集进 `scratch`。
    fn write_journal_hdrblock(
        &self,
        jr: &mut Journal,
        jip: &InodeSlot,
        header: &[u8; JHDR_SIZE],
        datablock: &[u8; BSIZE],
        scratch: &mut Transaction,
    ) {
        let mut offset = jr.offset;

        if writei(self, jip, header, offset, Some(scratch), false) != Ok(JHDR_SIZE) {
            panic!("journal write (header block) failed");
        }
        offset += JHDR_SIZE as u32;

        if writei(self, jip, datablock, offset, Some(scratch), false) != Ok(BSIZE) {
            panic!("journal write (data block) failed");
        }
        offset += BSIZE as u32;

        jr.offset = offset;
    }

    fn write_journal_header(
        &self,
        jr: &mut Journal,
        jip: &InodeSlot,
        kind: u8,
        timestamp: u64,
        scratch: &mut Transaction,
    ) {
        debug_assert!(kind == JRNL_START || kind == JRNL_COMMIT);
        let hd = JournalBlockHeader {
            timestamp,
            blocknum: 0,
            kind,
        };
        self.write_journal_hdrblock(jr, jip, &hd.encode(), &[0u8; BSIZE], scratch);
    }

    /// 估算日志剩余空间能否再容纳 `nblocks` 个数据槽加一个提交槽。
    ///
    /// `nblocks` 须把已聚合、尚未写出的块也计算在内。
    fn fits_in_journal(&self, jr: &Journal, nblocks: usize) -> bool {
        let trans_size = SLOT_SIZE * (1 + nblocks);
        jr.offset as usize + trans_size <= PHYS_JOURNAL_SIZE
    }

    /// 事务以 start 槽开始。调用者持有日志文件 inode 的写锁。
    fn write_journal_trans_prolog(
        &self,
        jr: &mut Journal,
        jip: &InodeSlot,
        timestamp: u64,
        scratch: &mut Transaction,
    ) {
        self.write_journal_header(jr, jip, JRNL_START, timestamp, scratch);
    }

    /// 把事务的数据块按顺序写进日志槽。头部携带聚合的 prolog
    /// 时间戳，回放时据此识别本事务的块。
    fn write_journal_transaction_blocks(
        &self,
        jr: &mut Journal,
        jip: &InodeSlot,
        blocks: &[DiskBlock],
        timestamp: u64,
        scratch: &mut Transaction,
    ) {
        for b in blocks {
            let hd = JournalBlockHeader {
                timestamp,
                blocknum: b.blockno,
                kind: JRNL_DATA,
            };
            self.write_journal_hdrblock(jr, jip, &hd.encode(), &b.data, scratch);
        }
    }

    /// 落盘已写的槽，然后写 commit 槽并落盘。commit 持久即提交。
    fn write_journal_trans_epilog(
        &self,
        jr: &mut Journal,
        jip: &InodeSlot,
        timestamp: u64,
        mut scratch: Transaction,
    ) {
        // start 与 data 槽必须先于 commit 持久化
        scratch.write_to_disk(&self.bcache);
        scratch.unpin_all(&self.bcache);
        self.dev_flush();

        let mut commit_tr = Transaction::new(0);
        self.write_journal_header(jr, jip, JRNL_COMMIT, timestamp, &mut commit_tr);
        commit_tr.write_to_disk(&self.bcache);
        commit_tr.unpin_all(&self.bcache);
        self.dev_flush();
    }

    /// 提交前处理：把本子事务的块分配与释放折叠成磁盘位图更新。
    fn pre_process_transaction(&self, tr: &mut Transaction) {
        let mut allocated = mem::take(tr.allocated_blocks());
        if !allocated.is_empty() {
            super::balloc::balloc_free_on_disk(self, &mut allocated, tr, true);
        }
        *tr.allocated_blocks() = allocated;

        let mut freed = mem::take(tr.free_blocks());
        if !freed.is_empty() {
            super::balloc::balloc_free_on_disk(self, &mut freed, tr, false);
        }
        *tr.free_blocks() = freed;
    }

    /// 提交后处理：事务已在日志中提交，释放的块此刻才回到内存
    /// 空闲链表，进过事务的缓冲块也到此解除钉住。
    fn post_process_transaction(&self, tr: &mut Transaction) {
        for &bno in tr.freed() {
            self.balloc().free_block(bno);
        }
        tr.unpin_all(&self.bcache);
    }

    /// 把已提交事务的块回写到原始位置。宿主设备是同步的，
    /// 异步回写与完成等待在这里合并成写完即完成。
    fn apply_trans_on_disk(&self, tr: &Transaction) {
        tr.write_to_disk(&self.bcache);
    }

    /// 文件内容路径：脏页写回后，把携带大小更新与块分配的子事务
    /// 排进待提交队列，随同本次 fsync 的聚合一起提交。
    pub(crate) fn add_fsync_to_journal(&self, tr: Transaction) {
        let mut jr = self.journal.lock().unwrap();
        jr.add_transaction_locked(tr);
    }

    /// 把待提交队列冲刷到磁盘日志，再把已提交的子事务应用到
    /// 文件系统原始位置。
    ///
    /// # 流程解释
    /// 子事务按时间戳顺序逐个并入聚合事务（同一块的多个版本
    /// 后写者胜）。下一个子事务在日志里放不下时，先写出、提交并
    /// 应用当前聚合，复位日志，再以该子事务的时间戳开启新的聚合。
    /// 单个子事务大于整个日志是致命错误。
    pub(crate) fn flush_journal_locked(&self, jr: &mut Journal) {
        if jr.pending.is_empty() {
            return;
        }
        let pending = mem::take(&mut jr.pending);

        let jip = self.journal_inode();
        let mut prune = Transaction::new(0);
        let mut processed: Vec<Transaction> = Vec::new();
        let mut prolog_ts = pending[0].timestamp;
        let mut scratch = Transaction::new(0);

        let mut jguard = Some(jip.ilock_write());
        self.write_journal_trans_prolog(jr, &jip, prolog_ts, &mut scratch);

        for mut tr in pending {
            let ts = tr.timestamp;
            self.pre_process_transaction(&mut tr);

            loop {
                if self.fits_in_journal(jr, prune.blocks().len() + tr.blocks().len()) {
                    prune.add_blocks(tr.take_blocks());
                    processed.push(tr);
                    break;
                }

                // 日志空间不足：提交并应用此前的子事务，腾出空间
                prune.deduplicate_blocks();
                self.write_journal_transaction_blocks(
                    jr,
                    &jip,
                    prune.blocks(),
                    prolog_ts,
                    &mut scratch,
                );
                let s = mem::replace(&mut scratch, Transaction::new(0));
                self.write_journal_trans_epilog(jr, &jip, prolog_ts, s);
                drop(jguard.take());

                for mut t in processed.drain(..) {
                    self.post_process_transaction(&mut t);
                }
                self.apply_trans_on_disk(&prune);
                self.dev_flush();

                jguard = Some(jip.ilock_write());
                self.reset_journal(jr, &jip);

                // 以本子事务的时间戳另起一个聚合，然后重试它
                prune = Transaction::new(0);
                prolog_ts = ts;
                self.write_journal_trans_prolog(jr, &jip, prolog_ts, &mut scratch);

                if !self.fits_in_journal(jr, tr.blocks().len()) {
                    panic!("journal: sub-transaction larger than the journal");
                }
            }
        }

        // 写出并提交剩余的聚合
        prune.deduplicate_blocks();
        if !prune.blocks().is_empty() {
            self.write_journal_transaction_blocks(jr, &jip, prune.blocks(), prolog_ts, &mut scratch);
        }
        let s = mem::replace(&mut scratch, Transaction::new(0));
        self.write_journal_trans_epilog(jr, &jip, prolog_ts, s);
        drop(jguard.take());

        for mut t in processed.drain(..) {
            self.post_process_transaction(&mut t);
        }
        self.apply_trans_on_disk(&prune);
        self.dev_flush();

        let jguard = jip.ilock_write();
        self.reset_journal(jr, &jip);
        drop(jguard);
    }

    /// 启动时线性扫描日志文件，回放已提交的事务。
    ///
    /// # 流程解释
    /// 槽间状态机：`start(T)` 开始收集；时间戳吻合的 `data(T, bno)`
    /// 追加进收集向量；`commit(T)` 把收集到的块并入回放事务。
    /// 零头部、短读或任何时间戳不匹配都终止扫描——commit 之后的
    /// 半截事务不会有与进行中 prolog 吻合的时间戳，自然被丢弃。
    /// 已提交的块先回写到原始位置并落盘，之后才复位日志；两次
    /// 回放与一次回放产生相同的磁盘状态。
    pub(crate) fn process_journal(&self) {
        let jip = self.journal_inode();
        let jguard = jip.ilock_write();

        let mut offset: u32 = 0;
        let mut current_ts: u64 = 0;
        let mut replay = Transaction::new(0);
        let mut block_vec: Vec<DiskBlock> = Vec::new();

        loop {
            let mut hdbuf = [0u8; JHDR_SIZE];
            match readi(self, &jip, &mut hdbuf, offset) {
                Ok(n) if n == JHDR_SIZE => {}
                _ => break,
            }
            if hdbuf.iter().all(|&b| b == 0) {
                // 零头部即日志尾
                break;
            }
            offset += JHDR_SIZE as u32;

            let mut databuf = [0u8; BSIZE];
            match readi(self, &jip, &mut databuf, offset) {
                Ok(n) if n == BSIZE => {}
                _ => break,
            }
            offset += BSIZE as u32;

            let hd = JournalBlockHeader::decode(&hdbuf);
            match hd.kind {
                JRNL_START => {
                    current_ts = hd.timestamp;
                    block_vec.clear();
                }
                JRNL_DATA => {
                    if hd.timestamp != current_ts {
                        break;
                    }
                    block_vec.push(DiskBlock::new(hd.blocknum, &databuf));
                }
                JRNL_COMMIT => {
                    if hd.timestamp != current_ts {
                        break;
                    }
                    replay.add_blocks(mem::take(&mut block_vec));
                }
                _ => break,
            }
        }

        // 只有带着 commit 的块得到回放；先回写原始位置并落盘，
        // 之后才允许复位日志，崩溃在两步之间不会丢失已提交内容
        if !replay.blocks().is_empty() {
            log::info!(
                "journal: replaying {} committed block(s)",
                replay.blocks().len()
            );
            replay.write_to_disk(&self.bcache);
            self.dev_flush();
        } else {
            log::info!("journal: nothing to recover");
        }

        {
            let mut jr = self.journal.lock().unwrap();
            self.reset_journal(&mut jr, &jip);
        }
        drop(jguard);
    }

    /// 复位日志：在偏移 0 写一个零头部并落盘。此后若崩溃重启，
    /// 日志里的旧事务都不会被重放；零头部之后被新事务（可能只写了
    /// 一半）覆盖时，靠头部里的时间戳甄别归属。
    pub(crate) fn reset_journal(&self, jr: &mut Journal, jip: &InodeSlot) {
        let zero = [0u8; JHDR_SIZE];
        let mut tr = Transaction::new(0);
        if writei(self, jip, &zero, 0, Some(&mut tr), false) != Ok(JHDR_SIZE) {
            panic!("reset_journal() failed");
        }
        tr.write_to_disk(&self.bcache);
        tr.unpin_all(&self.bcache);
        self.dev_flush();
        jr.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hd = JournalBlockHeader {
            timestamp: 0xdead_beef_0042,
            blocknum: 77,
            kind: JRNL_DATA,
        };
        let enc = hd.encode();
        let dec = JournalBlockHeader::decode(&enc);
        assert_eq!(dec.timestamp, 0xdead_beef_0042);
        assert_eq!(dec.blocknum, 77);
        assert_eq!(dec.kind, JRNL_DATA);
        // 头部其余部分保持零，零头部的判定不受干扰
        assert!(enc[13..].iter().all(|&b| b == 0));
    }

    #[test]
    fn slot_arithmetic() {
        // 槽大小与日志大小互相整除，fits 估算不会跨槽
        assert_eq!(PHYS_JOURNAL_SIZE % SLOT_SIZE, 0);
        assert_eq!(PHYS_JOURNAL_SIZE / SLOT_SIZE, 64);
    }
}
