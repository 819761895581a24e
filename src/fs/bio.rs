//! 缓存层
//!
//! 固定大小的缓冲块池，按 LRU 策略复用。每个缓冲块的数据由睡眠锁保护，
//! 持有 [`Buf`] 即持有该块的独占访问权；上层通过 [`Buf::bwrite`] 显式写回。
//! 事务提交时上层会把块内容的快照复制进事务，缓存中的较新内容不会被
//! 提前暴露到磁盘上。

use array_macro::array;

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::Mutex as SpinLock;

use crate::block_dev::BlockDevice;
use crate::consts::{BSIZE, NBUF};
use crate::sleeplock::{SleepLock, SleepLockGuard};

/// LRU 链表中的空指针。
const NONE: usize = usize::MAX;

/// 缓冲区缓存。
///
/// `ctrl` 维护所有缓冲块的元信息（块号、引用计数、LRU 链表位置），
/// 由自旋锁保护；`bufs` 存放块数据本体，每项由独立的睡眠锁保护，
/// 以便持有者在锁内进行设备 I/O。
pub(crate) struct Bcache {
    dev: Arc<dyn BlockDevice>,
    ctrl: SpinLock<BufLru>,
    bufs: [BufInner; NBUF],
}

impl Bcache {
    pub(crate) fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let this = Self {
            dev,
            ctrl: SpinLock::new(BufLru::new()),
            bufs: array![_ => BufInner::new(); NBUF],
        };
        this.ctrl.lock().init_links();
        this
    }

    pub(crate) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// 获取指定块号对应的缓冲块。
    ///
    /// # 功能说明
    /// 在缓存中查找块号对应的缓冲块；命中则增加引用计数并返回，
    /// 未命中则从 LRU 尾部回收一个未被引用的块复用。
    /// 本函数不做磁盘读取，调用者根据 `valid` 标志决定是否加载数据。
    ///
    /// # 可能的错误
    /// 所有缓冲块都在使用中时无法回收，触发 panic（`"no usable buffer"`）。
    fn bget(&self, blockno: u32) -> Buf<'_> {
        let mut ctrl = self.ctrl.lock();

        // 查找缓存块
        match ctrl.find_cached(blockno) {
            Some(index) => {
                drop(ctrl);
                Buf {
                    cache: self,
                    index,
                    blockno,
                    data: Some(self.bufs[index].data.lock()),
                }
            }
            None => {
                // 未缓存，回收最近最少使用的未引用缓冲块
                match ctrl.recycle(blockno) {
                    Some(index) => {
                        self.bufs[index].valid.store(false, Ordering::Relaxed);
                        drop(ctrl);
                        Buf {
                            cache: self,
                            index,
                            blockno,
                            data: Some(self.bufs[index].data.lock()),
                        }
                    }
                    None => panic!("bio: no usable buffer"),
                }
            }
        }
    }

    /// 读取指定块号的数据。
    ///
    /// 若缓冲块尚未加载（`valid == false`），从设备读入后再返回。
    /// 设备错误对请求路径是致命的。
    pub(crate) fn bread(&self, blockno: u32) -> Buf<'_> {
        let mut b = self.bget(blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            let offset = blockno as u64 * BSIZE as u64;
            if let Err(e) = self.dev.read_at(offset, &mut b.data_mut()[..]) {
                log::error!("bio: read block {} failed: {}", blockno, e);
                panic!("bio: device read failed");
            }
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// 获取将被整块覆盖的缓冲块，跳过磁盘读取。
    ///
    /// 调用者必须覆盖整个块的内容，否则块中会残留上一个宿主的数据。
    pub(crate) fn bread_for_overwrite(&self, blockno: u32) -> Buf<'_> {
        let b = self.bget(blockno);
        self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        b
    }

    /// 把一个未被引用的缓冲块逐出缓存。命中且无引用时返回 true。
    pub(crate) fn evict(&self, blockno: u32) -> bool {
        let mut ctrl = self.ctrl.lock();
        if let Some(index) = ctrl.find_unreferenced(blockno) {
            ctrl.inner[index].used = false;
            self.bufs[index].valid.store(false, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// 释放缓冲块的引用；引用归零时移动到 LRU 首部。
    fn brelse(&self, index: usize) {
        self.ctrl.lock().move_if_no_ref(index);
    }

    /// 释放对某块的钉住。与 [`Buf::pin`] 配对，由事务提交后的
    /// 处理调用。被钉住的块不可能被回收，找不到即是配对错误。
    pub(crate) fn unpin(&self, blockno: u32) {
        let mut ctrl = self.ctrl.lock();
        let mut i = ctrl.head;
        while i != NONE {
            let b = &ctrl.inner[i];
            if b.used && b.blockno == blockno {
                assert!(b.refcnt > 0, "bio: unpin not match for block {}", blockno);
                ctrl.move_if_no_ref(i);
                return;
            }
            i = b.next;
        }
        panic!("bio: unpin of uncached block {}", blockno);
    }
}

/// 已分配的缓冲块句柄，持有块数据的独占访问权。
///
/// 生命周期结束时自动释放数据锁并更新 LRU 状态。
pub(crate) struct Buf<'a> {
    cache: &'a Bcache,
    index: usize,
    blockno: u32,
    /// 在 `Buf` 存续期间始终为 `Some`；Drop 时先释放数据锁再归还引用。
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub(crate) fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 把缓冲块当前内容同步写回设备。
    pub(crate) fn bwrite(&mut self) {
        let offset = self.blockno as u64 * BSIZE as u64;
        if let Err(e) = self.cache.dev.write_at(offset, &self.data()[..]) {
            log::error!("bio: write block {} failed: {}", self.blockno, e);
            panic!("bio: device write failed");
        }
    }

    pub(crate) fn data(&self) -> &[u8; BSIZE] {
        &self.data.as_ref().unwrap().0
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.data.as_mut().unwrap().0
    }

    /// 指向缓冲区数据的原始常量指针，供按结构体解释块内容的调用方使用。
    pub(crate) fn raw_data(&self) -> *const BufData {
        let guard = self.data.as_ref().unwrap();
        &**guard
    }

    /// 指向缓冲区数据的原始可变指针。
    pub(crate) fn raw_data_mut(&mut self) -> *mut BufData {
        let guard = self.data.as_mut().unwrap();
        &mut **guard
    }

    /// 钉住缓冲块：引用计数加一，在与之配对的 unpin 之前该块不会
    /// 被回收。进入事务的块在提交前必须留在缓存里，否则中途被
    /// 逐出再读会读到设备上的旧内容。
    pub(crate) fn pin(&self) {
        self.cache.ctrl.lock().inner[self.index].refcnt += 1;
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.cache.brelse(self.index);
    }
}

/// 缓冲块元信息与 LRU 链表。链表用数组下标表示前驱后继，
/// 头部是最近使用的块，回收从尾部开始。
struct BufLru {
    inner: [BufCtrl; NBUF],
    head: usize,
    tail: usize,
}

impl BufLru {
    fn new() -> Self {
        Self {
            inner: array![_ => BufCtrl::new(); NBUF],
            head: NONE,
            tail: NONE,
        }
    }

    /// 初始化链表的头尾与前驱后继指针。仅在构造时调用一次。
    fn init_links(&mut self) {
        let len = self.inner.len();
        self.head = 0;
        self.tail = len - 1;
        for i in 0..len {
            self.inner[i].prev = if i == 0 { NONE } else { i - 1 };
            self.inner[i].next = if i == len - 1 { NONE } else { i + 1 };
            self.inner[i].index = i;
        }
    }

    /// 从头部开始查找已缓存的块，命中则增加引用计数。
    fn find_cached(&mut self, blockno: u32) -> Option<usize> {
        let mut i = self.head;
        while i != NONE {
            let b = &mut self.inner[i];
            if b.used && b.blockno == blockno {
                b.refcnt += 1;
                return Some(b.index);
            }
            i = b.next;
        }
        None
    }

    /// 查找已缓存且未被引用的块（供逐出使用）。
    fn find_unreferenced(&mut self, blockno: u32) -> Option<usize> {
        let mut i = self.head;
        while i != NONE {
            let b = &self.inner[i];
            if b.used && b.blockno == blockno {
                return (b.refcnt == 0).then_some(b.index);
            }
            i = b.next;
        }
        None
    }

    /// 从尾部回收一个引用计数为零的缓冲块，绑定到新块号。
    fn recycle(&mut self, blockno: u32) -> Option<usize> {
        let mut i = self.tail;
        while i != NONE {
            let b = &mut self.inner[i];
            if b.refcnt == 0 {
                b.blockno = blockno;
                b.used = true;
                b.refcnt = 1;
                return Some(b.index);
            }
            i = b.prev;
        }
        None
    }

    /// 引用计数归零时把缓冲块移到链表头部，延迟其被回收的时机。
    fn move_if_no_ref(&mut self, index: usize) {
        self.inner[index].refcnt -= 1;
        if self.inner[index].refcnt == 0 && self.head != index {
            // index 若位于尾部，尾指针前移
            if self.tail == index && self.inner[index].prev != NONE {
                self.tail = self.inner[index].prev;
            }

            // 摘除
            let (prev, next) = (self.inner[index].prev, self.inner[index].next);
            if next != NONE {
                self.inner[next].prev = prev;
            }
            if prev != NONE {
                self.inner[prev].next = next;
            }

            // 接到头部
            self.inner[index].prev = NONE;
            self.inner[index].next = self.head;
            if self.head != NONE {
                self.inner[self.head].prev = index;
            }
            self.head = index;
        }
    }
}

/// 单个缓冲块的控制信息。
struct BufCtrl {
    blockno: u32,
    /// 该控制块是否绑定着一个有效的块号。
    used: bool,
    prev: usize,
    next: usize,
    refcnt: usize,
    index: usize,
}

impl BufCtrl {
    fn new() -> Self {
        Self {
            blockno: 0,
            used: false,
            prev: NONE,
            next: NONE,
            refcnt: 0,
            index: 0,
        }
    }
}

/// 缓冲块的数据部分。
struct BufInner {
    /// 数据是否已从设备加载；在持有 ctrl 自旋锁或数据睡眠锁时访问。
    valid: AtomicBool,
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "BufData"),
        }
    }
}

/// 对齐方式需满足所有可能从块内容转换出的结构体。
#[repr(C, align(8))]
pub(crate) struct BufData(pub [u8; BSIZE]);

impl BufData {
    fn new() -> Self {
        Self([0; BSIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_dev::MemDisk;

    fn cache() -> Bcache {
        Bcache::new(Arc::new(MemDisk::new(64)))
    }

    #[test]
    fn read_write_roundtrip() {
        let bc = cache();
        {
            let mut b = bc.bread(3);
            b.data_mut()[0] = 0xab;
            b.bwrite();
        }
        // 逐出后重新读取，内容应来自设备
        assert!(bc.evict(3));
        let b = bc.bread(3);
        assert_eq!(b.data()[0], 0xab);
    }

    #[test]
    fn recycle_reuses_lru_slot() {
        let bc = cache();
        for bno in 0..NBUF as u32 {
            let _ = bc.bread(bno % 60);
        }
        // 没有引用在持有时，任何新块都能拿到缓冲
        let b = bc.bread(63);
        assert_eq!(b.read_blockno(), 63);
    }

    #[test]
    fn evict_fails_while_referenced() {
        let bc = cache();
        let b = bc.bread(5);
        assert!(!bc.evict(5));
        drop(b);
        assert!(bc.evict(5));
    }
}
