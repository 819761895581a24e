//! 索引节点层
//!
//! 磁盘 inode 按 [`IPB`] 个一块紧跟在超级块之后排布。内存中的 inode
//! 缓存以 inum 为键；查找先增加引用计数、再复查牺牲标志，踩到正在
//! 淘汰的条目就重试。条目由 `Arc` 持有，最后一个引用释放后才真正
//! 回收，这承担了原有延迟回收机制的角色。
//!
//! 每个 inode 的内容读写都要求至少持有读侧的 busy/readbusy 锁；
//! 地址槽是原子量，并发分配同一槽位以比较交换决出胜者，败者把
//! 刚分到的块退还给分配器。

use array_macro::array;

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use spin::Mutex as SpinLock;

use crate::consts::{BSIZE, MAX_FILE_SIZE, NCPU, NDIRECT, NINDIRECT};
use crate::error::{FsError, Result};

use super::balloc::{balloc, bfree};
use super::dir::DirIndex;
use super::oplog::my_cpu;
use super::transaction::Transaction;
use super::ScaleFs;

/// 单个块中的 inode 数量。
pub(crate) const IPB: usize = BSIZE / mem::size_of::<DiskInode>();

/// 给定 inode 编号，计算它在块内的偏移索引。
#[inline]
pub(crate) fn locate_inode_offset(inum: u32) -> isize {
    (inum as usize % IPB) as isize
}

/// Inode 类型。
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum InodeType {
    Empty = 0,
    Directory = 1,
    File = 2,
    Device = 3,
}

impl InodeType {
    pub(crate) fn from_u16(v: u16) -> Self {
        match v {
            0 => InodeType::Empty,
            1 => InodeType::Directory,
            2 => InodeType::File,
            3 => InodeType::Device,
            _ => panic!("inode: unknown type {}", v),
        }
    }
}

/// 磁盘上的 inode 结构体。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct DiskInode {
    pub(crate) itype: u16,
    pub(crate) major: u16,
    pub(crate) minor: u16,
    pub(crate) nlink: u16,
    pub(crate) size: u32,
    pub(crate) gen: u32,
    /// 前 [`NDIRECT`] 项为直接块，随后是一级间接块与二级间接块。
    pub(crate) addrs: [u32; NDIRECT + 2],
}

/// 写侧与读侧互斥的 busy/readbusy 锁状态。
struct LockState {
    busy: bool,
    readbusy: u32,
    /// 内容是否已从磁盘装载。
    valid: bool,
}

/// 写序号计数器：写者加锁期间计数为奇数，读者据此校验快照一致性。
pub(crate) struct SeqCount(AtomicU64);

impl SeqCount {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// 进入写临界区。要求调用者已持有该 inode 的写锁。
    pub(crate) fn write_begin(&self) -> SeqWriteGuard<'_> {
        let v = self.0.fetch_add(1, Ordering::AcqRel);
        debug_assert!(v % 2 == 0, "seq: nested write_begin");
        SeqWriteGuard(&self.0)
    }

    fn read_begin(&self) -> u64 {
        loop {
            let v = self.0.load(Ordering::Acquire);
            if v % 2 == 0 {
                return v;
            }
            core::hint::spin_loop();
        }
    }

    fn read_validate(&self, begin: u64) -> bool {
        self.0.load(Ordering::Acquire) == begin
    }
}

pub(crate) struct SeqWriteGuard<'a>(&'a AtomicU64);

impl<'a> Drop for SeqWriteGuard<'a> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// 内存中的 inode 缓存条目。
///
/// 字段均为原子量；修改它们要求持有写锁（`ilock_write`），
/// 读取内容要求至少持有读锁，`stat` 快照除外（以 `seq` 校验）。
pub(crate) struct InodeSlot {
    pub(crate) inum: u32,
    refs: AtomicUsize,
    victim: AtomicBool,
    state: Mutex<LockState>,
    cv: Condvar,

    pub(crate) itype: AtomicU16,
    major: AtomicU16,
    minor: AtomicU16,
    nlink: AtomicU16,
    pub(crate) size: AtomicU32,
    gen: AtomicU32,
    pub(crate) addrs: [AtomicU32; NDIRECT + 2],
    /// 一级间接块内容的内存缓存，构建完成后整体发布；
    /// 截断释放间接块时清空。
    iaddrs: SpinLock<Option<Arc<[AtomicU32; NINDIRECT]>>>,
    pub(crate) seq: SeqCount,
    /// 目录 inode 的内存索引，首次访问时构建。
    pub(crate) dir: spin::Once<DirIndex>,
}

impl InodeSlot {
    fn new(inum: u32) -> Self {
        Self {
            inum,
            refs: AtomicUsize::new(1),
            victim: AtomicBool::new(false),
            state: Mutex::new(LockState {
                busy: true,
                readbusy: 1,
                valid: false,
            }),
            cv: Condvar::new(),
            itype: AtomicU16::new(0),
            major: AtomicU16::new(0),
            minor: AtomicU16::new(0),
            nlink: AtomicU16::new(0),
            size: AtomicU32::new(0),
            gen: AtomicU32::new(0),
            addrs: array![_ => AtomicU32::new(0); NDIRECT + 2],
            iaddrs: SpinLock::new(None),
            seq: SeqCount::new(),
            dir: spin::Once::new(),
        }
    }

    /// 从磁盘读入 inode 内容。只在装载路径上调用，此时本槽位处于
    /// busy 状态，其他线程都在等待 `valid`。
    fn load_from_disk(&self, fs: &ScaleFs) {
        let buf = fs.bcache.bread(fs.sb.locate_inode(self.inum));
        let dinode = unsafe {
            ptr::read((buf.raw_data() as *const DiskInode).offset(locate_inode_offset(self.inum)))
        };
        drop(buf);

        self.itype.store(dinode.itype, Ordering::SeqCst);
        self.major.store(dinode.major, Ordering::Relaxed);
        self.minor.store(dinode.minor, Ordering::Relaxed);
        self.nlink.store(dinode.nlink, Ordering::SeqCst);
        self.size.store(dinode.size, Ordering::SeqCst);
        self.gen.store(dinode.gen, Ordering::Relaxed);
        for (i, a) in self.addrs.iter().enumerate() {
            a.store(dinode.addrs[i], Ordering::SeqCst);
        }
    }

    fn mark_valid(&self) {
        let mut state = self.state.lock().unwrap();
        state.valid = true;
        state.busy = false;
        state.readbusy = 0;
        drop(state);
        self.cv.notify_all();
    }

    fn wait_valid(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.valid {
            state = self.cv.wait(state).unwrap();
        }
    }

    /// 以写者身份加锁：等待所有读者与写者离开。
    pub(crate) fn ilock_write(&self) -> ILockGuard<'_> {
        let mut state = self.state.lock().unwrap();
        while state.busy || state.readbusy > 0 {
            state = self.cv.wait(state).unwrap();
        }
        state.busy = true;
        state.readbusy += 1;
        drop(state);
        ILockGuard { slot: self }
    }

    /// 以读者身份加锁：只排斥写者。
    pub(crate) fn ilock_read(&self) -> ILockGuard<'_> {
        let mut state = self.state.lock().unwrap();
        while state.busy {
            state = self.cv.wait(state).unwrap();
        }
        state.readbusy += 1;
        drop(state);
        ILockGuard { slot: self }
    }

    fn iunlock(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.busy && state.readbusy == 0 {
            panic!("inode {}: unlock while not locked", self.inum);
        }
        state.readbusy -= 1;
        state.busy = false;
        drop(state);
        self.cv.notify_all();
    }

    pub(crate) fn itype(&self) -> InodeType {
        InodeType::from_u16(self.itype.load(Ordering::SeqCst))
    }

    pub(crate) fn nlink(&self) -> u16 {
        self.nlink.load(Ordering::SeqCst)
    }

    /// 硬链接数加一。要求持有写锁。
    pub(crate) fn link(&self) {
        let _w = self.seq.write_begin();
        self.nlink.fetch_add(1, Ordering::SeqCst);
    }

    /// 硬链接数减一。要求持有写锁。
    pub(crate) fn unlink(&self) {
        let _w = self.seq.write_begin();
        let old = self.nlink.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "inode {}: unlink below zero", self.inum);
    }

    pub(crate) fn set_devnum(&self, major: u16, minor: u16) {
        self.major.store(major, Ordering::Relaxed);
        self.minor.store(minor, Ordering::Relaxed);
    }

    pub(crate) fn devnum(&self) -> (u16, u16) {
        (
            self.major.load(Ordering::Relaxed),
            self.minor.load(Ordering::Relaxed),
        )
    }
}

/// inode 锁守卫。读者与写者的释放路径相同。
pub(crate) struct ILockGuard<'a> {
    slot: &'a InodeSlot,
}

impl<'a> Drop for ILockGuard<'a> {
    fn drop(&mut self) {
        self.slot.iunlock();
    }
}

/// inode 的无锁状态快照，读取时以写序号校验。
#[derive(Debug, Clone, Copy)]
pub(crate) struct InodeStat {
    pub itype: InodeType,
    pub nlink: u16,
    pub size: u32,
    pub gen: u32,
}

pub(crate) fn istat(ip: &InodeSlot) -> InodeStat {
    loop {
        let begin = ip.seq.read_begin();
        let stat = InodeStat {
            itype: ip.itype(),
            nlink: ip.nlink.load(Ordering::Acquire),
            size: ip.size.load(Ordering::Acquire),
            gen: ip.gen.load(Ordering::Acquire),
        };
        if ip.seq.read_validate(begin) {
            return stat;
        }
    }
}

/// inode 缓存。
pub(crate) struct InodeCache {
    map: SpinLock<HashMap<u32, Arc<InodeSlot>>>,
    /// 各线程槽位上一次分配到的 inode 编号，下次从其后继开始扫描。
    last_inode: [AtomicU32; NCPU],
}

impl InodeCache {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            map: SpinLock::new(HashMap::new()),
            last_inode: array![_ => AtomicU32::new(0); NCPU],
        })
    }
}

/// 活动 inode 的句柄。克隆即增加引用计数；最后一个句柄释放时
/// 条目被标记为牺牲并从缓存移除。
pub(crate) struct Inode {
    cache: Arc<InodeCache>,
    slot: Arc<InodeSlot>,
}

impl core::ops::Deref for Inode {
    type Target = InodeSlot;
    fn deref(&self) -> &InodeSlot {
        &self.slot
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        self.slot.refs.fetch_add(1, Ordering::SeqCst);
        Self {
            cache: Arc::clone(&self.cache),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if self.slot.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            // 最后一个引用：标记牺牲，在缓存锁下复核后摘除。
            // 竞争的 iget 若在窗口内增加了引用，这里撤销牺牲标志，
            // 对方重试后会拿到仍然存活的条目。
            self.slot.victim.store(true, Ordering::SeqCst);
            let mut map = self.cache.map.lock();
            if self.slot.refs.load(Ordering::SeqCst) == 0 {
                if let Some(cur) = map.get(&self.slot.inum) {
                    if Arc::ptr_eq(cur, &self.slot) {
                        map.remove(&self.slot.inum);
                    }
                }
            } else {
                self.slot.victim.store(false, Ordering::SeqCst);
            }
        }
    }
}

/// 查找 inum 对应的内存 inode，必要时从磁盘装载。
///
/// # 功能说明
/// 缓存命中时先增加引用计数、再复查牺牲标志；与淘汰竞争失败
/// 则在内部以 [`FsError::Retry`] 重来。未命中时插入一个处于
/// busy 状态的新条目并从磁盘装载，等待者通过条件变量获知装载完成。
pub(crate) fn iget(fs: &ScaleFs, inum: u32) -> Inode {
    loop {
        match try_iget(fs, inum) {
            Ok(ip) => return ip,
            Err(FsError::Retry) => continue,
            Err(e) => panic!("iget: unexpected error {}", e),
        }
    }
}

fn try_iget(fs: &ScaleFs, inum: u32) -> Result<Inode> {
    let cached = fs.icache.map.lock().get(&inum).cloned();
    if let Some(slot) = cached {
        slot.refs.fetch_add(1, Ordering::SeqCst);
        if slot.victim.load(Ordering::SeqCst) {
            slot.refs.fetch_sub(1, Ordering::SeqCst);
            return Err(FsError::Retry);
        }
        slot.wait_valid();
        return Ok(Inode {
            cache: Arc::clone(&fs.icache),
            slot,
        });
    }

    // 未命中：插入 busy 状态的新槽位再装载
    let slot = Arc::new(InodeSlot::new(inum));
    {
        let mut map = fs.icache.map.lock();
        if map.contains_key(&inum) {
            return Err(FsError::Retry);
        }
        map.insert(inum, Arc::clone(&slot));
    }
    slot.load_from_disk(fs);
    slot.mark_valid();
    Ok(Inode {
        cache: Arc::clone(&fs.icache),
        slot,
    })
}

/// 分配一个给定类型的磁盘 inode。
///
/// # 功能说明
/// 从当前线程槽位上一次分配的编号之后开始环形扫描 inode 表，
/// 对每个候选者在内存副本的类型字段上做比较交换（0 → 目标类型），
/// 成功者独占该 inode 并把代数计数加一。
///
/// # 可能的错误
/// 扫描一整圈仍无空闲 inode 时触发 panic（inode 表耗尽）。
pub(crate) fn ialloc(fs: &ScaleFs, itype: InodeType) -> Inode {
    let ninodes = fs.sb.inode_size();
    let cpu = my_cpu();
    let mut inum = (fs.icache.last_inode[cpu].load(Ordering::Relaxed) + 1) % ninodes;

    for _ in 0..ninodes {
        if inum != 0 {
            if let Some(ip) = try_ialloc(fs, inum, itype) {
                fs.icache.last_inode[cpu].store(inum, Ordering::Relaxed);
                return ip;
            }
        }
        inum = (inum + 1) % ninodes;
    }

    panic!("ialloc: 0/{} inodes", ninodes);
}

fn try_ialloc(fs: &ScaleFs, inum: u32, itype: InodeType) -> Option<Inode> {
    let ip = iget(fs, inum);
    if ip
        .itype
        .compare_exchange(0, itype as u16, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return None;
    }

    let guard = ip.ilock_write();
    {
        let _w = ip.seq.write_begin();
        ip.gen.fetch_add(1, Ordering::Relaxed);
    }
    if ip.nlink() != 0 || ip.size.load(Ordering::SeqCst) != 0 || ip.addrs[0].load(Ordering::SeqCst) != 0
    {
        panic!("try_ialloc: inode {} not zeroed", inum);
    }
    drop(guard);
    Some(ip)
}

/// 把内存中的 inode 写回它所在的表块；间接块缓存存在时一并重写
/// 间接块。两者都追加进事务（如给出）。
pub(crate) fn iupdate(fs: &ScaleFs, ip: &InodeSlot, mut tr: Option<&mut Transaction>) {
    let blockno = fs.sb.locate_inode(ip.inum);
    let dinode = DiskInode {
        itype: ip.itype.load(Ordering::SeqCst),
        major: ip.major.load(Ordering::Relaxed),
        minor: ip.minor.load(Ordering::Relaxed),
        nlink: ip.nlink.load(Ordering::SeqCst),
        size: ip.size.load(Ordering::SeqCst),
        gen: ip.gen.load(Ordering::Relaxed),
        addrs: array![i => ip.addrs[i].load(Ordering::SeqCst); NDIRECT + 2],
    };

    {
        let mut buf = fs.bcache.bread(blockno);
        unsafe {
            ptr::write(
                (buf.raw_data_mut() as *mut DiskInode).offset(locate_inode_offset(ip.inum)),
                dinode,
            );
        }
        if let Some(tr) = tr.as_deref_mut() {
            tr.add_buf_unique(&buf);
        }
    }

    let ibno = ip.addrs[NDIRECT].load(Ordering::SeqCst);
    if ibno != 0 {
        if let Some(ia) = ip.iaddrs.lock().clone() {
            let mut buf = fs.bcache.bread(ibno);
            for (i, a) in ia.iter().enumerate() {
                write_u32(buf.data_mut(), i, a.load(Ordering::SeqCst));
            }
            if let Some(tr) = tr {
                tr.add_buf_unique(&buf);
            }
        }
    }
}

#[inline]
fn read_u32(data: &[u8; BSIZE], idx: usize) -> u32 {
    u32::from_ne_bytes(data[idx * 4..idx * 4 + 4].try_into().unwrap())
}

#[inline]
fn write_u32(data: &mut [u8; BSIZE], idx: usize, v: u32) {
    data[idx * 4..idx * 4 + 4].copy_from_slice(&v.to_ne_bytes());
}

/// 取得（必要时构建）一级间接块内容的内存缓存。
///
/// 先保证间接块本身存在，然后在不持锁的情况下从磁盘读出内容、
/// 构建数组，最后发布；竞争失败的一方丢弃自己的副本沿用胜者的。
fn ensure_iaddrs(
    fs: &ScaleFs,
    ip: &InodeSlot,
    mut tr: Option<&mut Transaction>,
) -> Result<Arc<[AtomicU32; NINDIRECT]>> {
    if let Some(ia) = ip.iaddrs.lock().clone() {
        return Ok(ia);
    }

    let ibno = loop {
        let addr = ip.addrs[NDIRECT].load(Ordering::SeqCst);
        if addr != 0 {
            break addr;
        }
        let nb = balloc(fs, tr.as_deref_mut(), true)?;
        if ip.addrs[NDIRECT]
            .compare_exchange(0, nb, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break nb;
        }
        log::debug!("bmap: indirect block race on inode {}", ip.inum);
        bfree(fs, nb, tr.as_deref_mut(), false);
    };

    let buf = fs.bcache.bread(ibno);
    let arr: Arc<[AtomicU32; NINDIRECT]> =
        Arc::new(array![i => AtomicU32::new(read_u32(buf.data(), i)); NINDIRECT]);
    drop(buf);

    let mut guard = ip.iaddrs.lock();
    match guard.clone() {
        Some(existing) => Ok(existing),
        None => {
            *guard = Some(Arc::clone(&arr));
            Ok(arr)
        }
    }
}

/// 返回 inode 中第 `bn` 个逻辑块对应的磁盘块号，必要时逐层分配。
///
/// # 功能说明
/// 三级寻址：直接块、经 `addrs[NDIRECT]` 的一级间接块（其内容另有
/// 内存缓存）、经 `addrs[NDIRECT+1]` 的二级间接树。对同一槽位的并发
/// 分配以比较交换决出胜者，败者把块退还分配器；中间块分配时总是
/// 清零。分配出的叶子块按 `zero_on_alloc` 决定是否清零。
///
/// # 可能的错误
/// - 分配器耗尽时返回 [`FsError::OutOfBlocks`]；
/// - `bn` 超出三级寻址范围是致命错误。
pub(crate) fn bmap(
    fs: &ScaleFs,
    ip: &InodeSlot,
    bn: usize,
    mut tr: Option<&mut Transaction>,
    zero_on_alloc: bool,
) -> Result<u32> {
    if bn < NDIRECT {
        loop {
            let addr = ip.addrs[bn].load(Ordering::SeqCst);
            if addr != 0 {
                return Ok(addr);
            }
            let nb = balloc(fs, tr.as_deref_mut(), zero_on_alloc)?;
            if ip.addrs[bn]
                .compare_exchange(0, nb, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(nb);
            }
            log::debug!("bmap: direct slot race on inode {}", ip.inum);
            bfree(fs, nb, tr.as_deref_mut(), false);
        }
    }
    let bn = bn - NDIRECT;

    if bn < NINDIRECT {
        let iaddrs = ensure_iaddrs(fs, ip, tr.as_deref_mut())?;
        loop {
            let addr = iaddrs[bn].load(Ordering::SeqCst);
            if addr != 0 {
                return Ok(addr);
            }
            let nb = balloc(fs, tr.as_deref_mut(), zero_on_alloc)?;
            if iaddrs[bn]
                .compare_exchange(0, nb, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // 缓冲块与 iaddrs 缓存保持同步；间接块的当前内容
                // 整体记入事务
                let ibno = ip.addrs[NDIRECT].load(Ordering::SeqCst);
                let mut ibuf = fs.bcache.bread(ibno);
                for (i, a) in iaddrs.iter().enumerate() {
                    write_u32(ibuf.data_mut(), i, a.load(Ordering::SeqCst));
                }
                if let Some(tr) = tr.as_deref_mut() {
                    tr.add_buf_unique(&ibuf);
                }
                return Ok(nb);
            }
            log::debug!("bmap: indirect slot race on inode {}", ip.inum);
            bfree(fs, nb, tr.as_deref_mut(), false);
        }
    }
    let bn = bn - NINDIRECT;

    if bn >= NINDIRECT * NINDIRECT {
        panic!("bmap: {} out of range", bn);
    }

    // 二级间接块没有内存缓存，经缓冲块独占访问逐层定位。
    let l1bno = loop {
        let addr = ip.addrs[NDIRECT + 1].load(Ordering::SeqCst);
        if addr != 0 {
            break addr;
        }
        let nb = balloc(fs, tr.as_deref_mut(), true)?;
        if ip.addrs[NDIRECT + 1]
            .compare_exchange(0, nb, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break nb;
        }
        bfree(fs, nb, tr.as_deref_mut(), false);
    };

    let l2bno = {
        let mut b1 = fs.bcache.bread(l1bno);
        let idx = bn / NINDIRECT;
        let cur = read_u32(b1.data(), idx);
        if cur == 0 {
            let nb = balloc(fs, tr.as_deref_mut(), true)?;
            write_u32(b1.data_mut(), idx, nb);
            if let Some(tr) = tr.as_deref_mut() {
                tr.add_buf_unique(&b1);
            }
            nb
        } else {
            cur
        }
    };

    let mut b2 = fs.bcache.bread(l2bno);
    let idx = bn % NINDIRECT;
    let cur = read_u32(b2.data(), idx);
    if cur == 0 {
        let nb = balloc(fs, tr.as_deref_mut(), zero_on_alloc)?;
        write_u32(b2.data_mut(), idx, nb);
        if let Some(tr) = tr.as_deref_mut() {
            tr.add_buf_unique(&b2);
        }
        Ok(nb)
    } else {
        Ok(cur)
    }
}

#[inline]
fn block_roundup(off: usize) -> usize {
    if off % BSIZE != 0 {
        off / BSIZE + 1
    } else {
        off / BSIZE
    }
}

/// 释放偏移 `offset` 及之后的所有数据块。
///
/// # 功能说明
/// 对称地处理三级寻址：叶子块进入事务的延迟释放列表；中间块只在
/// 其子树完全清空时释放，部分改写的中间块追加进事务。整块释放
/// 一级间接块时同时丢弃其内存缓存。
pub(crate) fn itrunc(fs: &ScaleFs, ip: &InodeSlot, offset: u32, tr: &mut Transaction) {
    let _w = ip.seq.write_begin();
    if ip.size.load(Ordering::SeqCst) <= offset {
        return;
    }
    let off = offset as usize;

    // 直接块
    for i in block_roundup(off).min(NDIRECT)..NDIRECT {
        let addr = ip.addrs[i].load(Ordering::SeqCst);
        if addr != 0 {
            bfree(fs, addr, Some(tr), true);
            ip.addrs[i].store(0, Ordering::SeqCst);
        }
    }

    // 一级间接
    let ibno = ip.addrs[NDIRECT].load(Ordering::SeqCst);
    if ibno != 0 {
        let start = if off >= NDIRECT * BSIZE {
            block_roundup(off - NDIRECT * BSIZE).min(NINDIRECT)
        } else {
            0
        };
        {
            let mut buf = fs.bcache.bread(ibno);
            // 先把内存缓存的最新内容刷进块
            if let Some(ia) = ip.iaddrs.lock().clone() {
                for (i, a) in ia.iter().enumerate() {
                    write_u32(buf.data_mut(), i, a.load(Ordering::SeqCst));
                }
            }
            for i in start..NINDIRECT {
                let a = read_u32(buf.data(), i);
                if a != 0 {
                    bfree(fs, a, Some(tr), true);
                    write_u32(buf.data_mut(), i, 0);
                }
            }
            if start != 0 {
                tr.add_buf_unique(&buf);
            }
        }
        if start == 0 {
            bfree(fs, ibno, Some(tr), true);
            ip.addrs[NDIRECT].store(0, Ordering::SeqCst);
            *ip.iaddrs.lock() = None;
        } else if let Some(ia) = ip.iaddrs.lock().clone() {
            for i in start..NINDIRECT {
                ia[i].store(0, Ordering::SeqCst);
            }
        }
    }

    // 二级间接
    let l1bno = ip.addrs[NDIRECT + 1].load(Ordering::SeqCst);
    if l1bno != 0 {
        let bno_off = if off >= (NDIRECT + NINDIRECT) * BSIZE {
            block_roundup(off - (NDIRECT + NINDIRECT) * BSIZE)
        } else {
            0
        };
        {
            let mut b1 = fs.bcache.bread(l1bno);
            for i in bno_off / NINDIRECT..NINDIRECT {
                let a1 = read_u32(b1.data(), i);
                if a1 == 0 {
                    continue;
                }
                let start = if i == bno_off / NINDIRECT {
                    bno_off % NINDIRECT
                } else {
                    0
                };
                {
                    let mut b2 = fs.bcache.bread(a1);
                    for j in start..NINDIRECT {
                        let a2 = read_u32(b2.data(), j);
                        if a2 != 0 {
                            bfree(fs, a2, Some(tr), true);
                            write_u32(b2.data_mut(), j, 0);
                        }
                    }
                    if start != 0 {
                        tr.add_buf_unique(&b2);
                    }
                }
                if start == 0 {
                    bfree(fs, a1, Some(tr), true);
                    write_u32(b1.data_mut(), i, 0);
                }
            }
            if bno_off != 0 {
                tr.add_buf_unique(&b1);
            }
        }
        if bno_off == 0 {
            bfree(fs, l1bno, Some(tr), true);
            ip.addrs[NDIRECT + 1].store(0, Ordering::SeqCst);
        }
    }

    ip.size.store(offset, Ordering::SeqCst);
}

/// 从 inode 读取数据到 `dst`，返回读到的字节数（到文件尾截断）。
///
/// 读路径不该分配块；稳态下 `bmap` 在这里触发 `OutOfBlocks` 属于
/// 致命错误。
pub(crate) fn readi(fs: &ScaleFs, ip: &InodeSlot, dst: &mut [u8], off: u32) -> Result<usize> {
    if ip.itype() == InodeType::Device {
        return Err(FsError::InvalidArg);
    }
    let size = ip.size.load(Ordering::SeqCst);
    if off > size {
        return Err(FsError::InvalidArg);
    }
    let n = (dst.len()).min((size - off) as usize);

    let mut tot = 0;
    let mut off = off as usize;
    while tot < n {
        let m = (n - tot).min(BSIZE - off % BSIZE);
        let bno = match bmap(fs, ip, off / BSIZE, None, true) {
            Ok(b) => b,
            Err(FsError::OutOfBlocks) => panic!("readi: out of blocks"),
            Err(e) => return Err(e),
        };
        let buf = fs.bcache.bread(bno);
        dst[tot..tot + m].copy_from_slice(&buf.data()[off % BSIZE..off % BSIZE + m]);
        drop(buf);
        tot += m;
        off += m;
    }
    Ok(n)
}

/// 把 `src` 写入 inode 的数据区，返回写入的字节数。
///
/// # 功能说明
/// `writeback == true` 时数据块绕过日志直接写回设备（常规文件内容
/// 页的路径）；否则块内容快照进入事务（目录项、间接块等元数据的
/// 路径）。整块覆盖时跳过磁盘读。本函数不更新 inode 的大小，由
/// 调用者在合适的时机统一 [`update_size`]。
///
/// # 可能的错误
/// 中途分配失败时返回已写入的字节数；一个字节都没写进去则返回
/// [`FsError::OutOfBlocks`]。写越过最大文件大小的部分被截断。
pub(crate) fn writei(
    fs: &ScaleFs,
    ip: &InodeSlot,
    src: &[u8],
    off: u32,
    mut tr: Option<&mut Transaction>,
    writeback: bool,
) -> Result<usize> {
    if ip.itype() == InodeType::Device {
        return Err(FsError::InvalidArg);
    }
    let off = off as usize;
    if off >= MAX_FILE_SIZE {
        return Err(FsError::InvalidArg);
    }
    let end = off.checked_add(src.len()).ok_or(FsError::InvalidArg)?;
    let n = if end > MAX_FILE_SIZE {
        MAX_FILE_SIZE - off
    } else {
        src.len()
    };

    let mut tot = 0;
    let mut off = off;
    while tot < n {
        let m = (n - tot).min(BSIZE - off % BSIZE);
        // 整块覆盖时不必从磁盘读旧内容
        let skip_disk_read = off % BSIZE == 0 && m == BSIZE;

        let blockno = match bmap(fs, ip, off / BSIZE, tr.as_deref_mut(), !skip_disk_read) {
            Ok(b) => b,
            Err(FsError::OutOfBlocks) => {
                log::warn!("writei: out of blocks on inode {}", ip.inum);
                if tot == 0 {
                    return Err(FsError::OutOfBlocks);
                }
                break;
            }
            Err(e) => return Err(e),
        };

        let mut buf = if skip_disk_read {
            fs.bcache.bread_for_overwrite(blockno)
        } else {
            fs.bcache.bread(blockno)
        };
        buf.data_mut()[off % BSIZE..off % BSIZE + m].copy_from_slice(&src[tot..tot + m]);

        if !writeback {
            if let Some(tr) = tr.as_deref_mut() {
                tr.add_buf_unique(&buf);
            }
        } else {
            buf.bwrite();
        }
        drop(buf);

        tot += m;
        off += m;
    }
    Ok(tot)
}

/// 更新文件大小并写回 inode。
pub(crate) fn update_size(fs: &ScaleFs, ip: &InodeSlot, size: u32, tr: &mut Transaction) {
    {
        let _w = ip.seq.write_begin();
        ip.size.store(size, Ordering::SeqCst);
    }
    iupdate(fs, ip, Some(tr));
}

/// 在磁盘上释放一个 inode：类型清零并写回。调用前链接数必须已为零。
pub(crate) fn free_inode(fs: &ScaleFs, ip: &Inode, tr: &mut Transaction) {
    let guard = ip.ilock_write();
    assert_eq!(ip.nlink(), 0, "free_inode: inode {} still linked", ip.inum);
    {
        let _w = ip.seq.write_begin();
        ip.itype.store(InodeType::Empty as u16, Ordering::SeqCst);
        ip.set_devnum(0, 0);
    }
    iupdate(fs, ip, Some(tr));
    drop(guard);
}

/// 把该文件占用的干净缓冲块从缓冲区缓存中逐出（含各级间接块）。
pub(crate) fn drop_bufcache(fs: &ScaleFs, ip: &InodeSlot) {
    for i in 0..NDIRECT {
        let a = ip.addrs[i].load(Ordering::SeqCst);
        if a != 0 {
            fs.bcache.evict(a);
        }
    }

    let ibno = ip.addrs[NDIRECT].load(Ordering::SeqCst);
    if ibno != 0 {
        let entries: Vec<u32> = {
            let buf = fs.bcache.bread(ibno);
            (0..NINDIRECT).map(|i| read_u32(buf.data(), i)).collect()
        };
        for a in entries.into_iter().filter(|a| *a != 0) {
            fs.bcache.evict(a);
        }
        fs.bcache.evict(ibno);
    }

    let l1bno = ip.addrs[NDIRECT + 1].load(Ordering::SeqCst);
    if l1bno != 0 {
        let l1: Vec<u32> = {
            let buf = fs.bcache.bread(l1bno);
            (0..NINDIRECT).map(|i| read_u32(buf.data(), i)).collect()
        };
        for a1 in l1.into_iter().filter(|a| *a != 0) {
            let l2: Vec<u32> = {
                let buf = fs.bcache.bread(a1);
                (0..NINDIRECT).map(|i| read_u32(buf.data(), i)).collect()
            };
            for a2 in l2.into_iter().filter(|a| *a != 0) {
                fs.bcache.evict(a2);
            }
            fs.bcache.evict(a1);
        }
        fs.bcache.evict(l1bno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dinode_layout() {
        // 每块恰好容纳整数个 inode，块内偏移稳定
        assert_eq!(mem::size_of::<DiskInode>(), 64);
        assert_eq!(IPB, 8);
        assert_eq!(locate_inode_offset(9), 1);
    }

    #[test]
    fn seqcount_detects_overlap() {
        let seq = SeqCount::new();
        let begin = seq.read_begin();
        {
            let _w = seq.write_begin();
        }
        assert!(!seq.read_validate(begin));
        let begin = seq.read_begin();
        assert!(seq.read_validate(begin));
    }
}
