//! 文件系统核心
//!
//! [`ScaleFs`] 是整个核心的进程级上下文：缓冲区缓存、inode 缓存、
//! 块分配器、物理日志、mnode 表、逐对象逻辑日志与编号映射都挂在
//! 它上面，启动时一次构建，经公共入口贯穿所有操作。
//!
//! 元数据操作只改内存对象并向逻辑日志追加记录；fsync 时解析器把
//! 相关记录线性化为子事务交给物理日志提交。装载顺序：回放日志、
//! 初始化空闲位向量（回放可能更新位图块）、回收推迟删除的 inode、
//! 装载根目录。

pub(crate) mod balloc;
pub(crate) mod bio;
pub(crate) mod dir;
pub(crate) mod inode;
pub(crate) mod journal;
pub mod mkfs;
pub mod mnode;
pub(crate) mod oplog;
pub(crate) mod resolver;
pub(crate) mod superblock;
pub(crate) mod transaction;

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use spin::Mutex as SpinLock;

use crate::block_dev::BlockDevice;
use crate::consts::{BSIZE, JOURNAL_NAME, MAX_FILE_SIZE, ROOTINUM};
use crate::error::{FsError, Result};
use crate::sleeplock::SleepLock;

use balloc::BlockAllocator;
use bio::Bcache;
use dir::{dirlookup, DirName};
use inode::{iget, istat, readi, update_size, writei, InodeCache, InodeType};
use journal::Journal;
use mnode::{new_kind, Mnode, MnodeTable, MnodeType, Mnum};
use oplog::{MfsLog, OpKind, Operation};
use superblock::SuperBlock;
use transaction::Transaction;

/// 文件系统对象的状态快照。
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub mtype: MnodeType,
    /// 文件按内存视角、目录按磁盘内容计的大小；设备为 0。
    pub size: u64,
    /// 内存视角的链接数。
    pub links: u32,
    /// 磁盘 inode 编号；对象尚未持久化时为 None。
    pub inum: Option<u32>,
    /// 磁盘上的硬链接数（未持久化时为 0）。
    pub nlink: u16,
    /// 磁盘 inode 的代数计数。
    pub gen: u32,
}

/// 文件系统核心的进程级上下文。
pub struct ScaleFs {
    pub(crate) bcache: Bcache,
    pub(crate) sb: SuperBlock,
    pub(crate) icache: Arc<InodeCache>,
    balloc: OnceLock<BlockAllocator>,
    pub(crate) journal: Mutex<Journal>,
    pub(crate) journal_inum: OnceLock<u32>,
    pub(crate) mnodes: MnodeTable,
    pub(crate) logs: SpinLock<HashMap<Mnum, Arc<MfsLog>>>,
    pub(crate) mnum_to_inum: SpinLock<HashMap<Mnum, u32>>,
    pub(crate) inum_to_mnum: SpinLock<HashMap<u32, Mnum>>,
    pub(crate) mnode_locks: SpinLock<HashMap<Mnum, Arc<SleepLock<()>>>>,
    /// 全局单调时间戳源，唯一地标定每条操作记录。
    tsc: AtomicU64,
    root_mnum: OnceLock<Mnum>,
    /// 跨目录的目录重命名串行化。
    rename_lock: Mutex<()>,
}

impl ScaleFs {
    /// 在给定设备上装载文件系统。
    ///
    /// # 流程解释
    /// 1. 读超级块、定位日志文件；
    /// 2. 回放物理日志中已提交的事务；
    /// 3. 从磁盘位图初始化空闲位向量（必须在回放之后，回放的事务
    ///    可能包含位图块更新）；
    /// 4. 走一遍超级块里的延迟回收列表，截断并释放这些 inode；
    /// 5. 装载根目录的 mnode。
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Result<Arc<ScaleFs>> {
        let bcache = Bcache::new(dev);
        let sb = SuperBlock::load(&bcache)?;

        let fs = Arc::new(ScaleFs {
            bcache,
            sb,
            icache: InodeCache::new(),
            balloc: OnceLock::new(),
            journal: Mutex::new(Journal::new()),
            journal_inum: OnceLock::new(),
            mnodes: MnodeTable::new(),
            logs: SpinLock::new(HashMap::new()),
            mnum_to_inum: SpinLock::new(HashMap::new()),
            inum_to_mnum: SpinLock::new(HashMap::new()),
            mnode_locks: SpinLock::new(HashMap::new()),
            tsc: AtomicU64::new(1),
            root_mnum: OnceLock::new(),
            rename_lock: Mutex::new(()),
        });

        // 定位日志文件。这里读到的根目录内容只用于拿日志文件的
        // inode 编号（它在 mkfs 后不再变化）；句柄离开作用域后相应
        // 缓存条目即被淘汰，回放后的重新读取总是拿到新内容。
        {
            let root_ip = iget(&fs, ROOTINUM);
            if root_ip.itype() != InodeType::Directory {
                return Err(FsError::InvalidArg);
            }
            let jname = DirName::new(JOURNAL_NAME).unwrap();
            let jip = dirlookup(&fs, &root_ip, &jname).ok_or(FsError::NotFound)?;
            fs.journal_inum
                .set(jip.inum)
                .expect("journal inum set twice");
        }

        // 检查日志并重放已提交的事务
        fs.process_journal();

        // 空闲位向量在日志处理之后初始化
        if fs.balloc.set(BlockAllocator::initialize(&fs)).is_err() {
            panic!("mount: allocator initialized twice");
        }

        // 回收 fsync 时因打开引用而推迟删除的 inode
        fs.reclaim_deferred_inodes();

        let root = fs.load_root();
        fs.root_mnum
            .set(root.mnum())
            .expect("root mnum set twice");

        log::info!(
            "scalefs: mount complete, root mnum {}, {}/{} data blocks free",
            root.mnum(),
            fs.balloc().free_count(),
            fs.sb.nblocks()
        );
        Ok(fs)
    }

    pub(crate) fn balloc(&self) -> &BlockAllocator {
        self.balloc.get().expect("allocator not initialized")
    }

    pub(crate) fn root_mnum(&self) -> Mnum {
        *self.root_mnum.get().expect("root not loaded")
    }

    /// 根目录的 mnum。
    pub fn root(&self) -> Mnum {
        self.root_mnum()
    }

    /// 下一个全局唯一的单调时间戳。
    pub(crate) fn next_tsc(&self) -> u64 {
        self.tsc.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ------------------------------------------------------------------
    // 启动路径

    /// 截断并释放超级块回收列表里的 inode，随后清空列表并持久化。
    fn reclaim_deferred_inodes(&self) {
        let mut reclaim = self.sb.reclaim();
        if reclaim.count == 0 {
            return;
        }
        log::info!("scalefs: reclaiming {} deferred inode(s)", reclaim.count);

        let mut jr = self.journal.lock().unwrap();
        for i in 0..reclaim.count as usize {
            let inum = reclaim.inums[i];
            if inum == 0 {
                continue;
            }
            let ip = iget(self, inum);
            // 回收列表的登记不走日志。崩溃发生在解链事务提交之前时，
            // 列表里会留下一个链接数不为零的 inode——目录项还指着它，
            // 不能回收，清掉登记即可。
            if ip.nlink() != 0 {
                log::warn!(
                    "scalefs: inode {} in reclaim list still has {} link(s), skipping",
                    inum,
                    ip.nlink()
                );
                reclaim.inums[i] = 0;
                continue;
            }
            let mut tr = Transaction::new(self.next_tsc());
            {
                let guard = ip.ilock_write();
                inode::itrunc(self, &ip, 0, &mut tr);
                drop(guard);
            }
            inode::free_inode(self, &ip, &mut tr);
            jr.add_transaction_locked(tr);
            reclaim.inums[i] = 0;
        }
        self.flush_journal_locked(&mut jr);
        drop(jr);

        reclaim.count = 0;
        self.sb.write_back(&self.bcache, &reclaim);
    }

    /// 装载根目录对应的 mnode（及编号映射、逻辑日志）。
    fn load_root(&self) -> Arc<Mnode> {
        if let Some(mnum) = self.mnum_for_inum(ROOTINUM) {
            return self.mnodes.get(mnum).expect("root mnode lost");
        }
        let ip = iget(self, ROOTINUM);
        assert_eq!(ip.itype(), InodeType::Directory, "root is not a directory");
        let m = self.mnode_alloc(ROOTINUM, MnodeType::Dir, (0, 0));
        // 根目录的父目录是它自己
        m.as_dir().parent.store(m.mnum(), Ordering::SeqCst);
        m
    }

    /// 为一个已存在于磁盘上的 inode 建立 mnode 与配套结构。
    fn mnode_alloc(&self, inum: u32, mtype: MnodeType, devnum: (u16, u16)) -> Arc<Mnode> {
        let m = self.mnodes.alloc(new_kind(mtype, devnum.0, devnum.1), 0);
        self.inum_to_mnum.lock().insert(inum, m.mnum());
        self.mnum_to_inum.lock().insert(m.mnum(), inum);
        self.alloc_metadata_log(m.mnum());
        self.alloc_mnode_lock(m.mnum());
        m
    }

    /// 磁盘目录项对应的 mnode，没有时装载创建。
    fn load_dir_entry(&self, inum: u32, parent_mnum: Mnum) -> Option<Arc<Mnode>> {
        if let Some(mnum) = self.mnum_for_inum(inum) {
            return self.mnodes.get(mnum);
        }

        let ip = iget(self, inum);
        let mtype = MnodeType::from_itype(ip.itype())?;
        let m = self.mnode_alloc(inum, mtype, ip.devnum());
        if m.is_dir() {
            // 父链接在 mnode 创建时建立，目录项里的 ".." 不再重复
            m.as_dir().parent.store(parent_mnum, Ordering::SeqCst);
        }
        Some(m)
    }

    /// 目录 mnode 首次被访问时，从磁盘重建它的名字映射。
    fn initialize_dir(&self, m: &Arc<Mnode>) {
        let dir = m.as_dir();
        if dir.initialized.load(Ordering::SeqCst) {
            return;
        }

        if let Some(inum) = self.inum_lookup(m.mnum()) {
            let ip = iget(self, inum);
            let index = dir::dir_init(self, &ip);
            for (name, info) in index.entries() {
                if name.is_dot() || name.is_dotdot() {
                    continue;
                }
                let Some(child) = self.load_dir_entry(info.inum, m.mnum()) else {
                    continue;
                };
                let inserted = dir
                    .entries
                    .lock()
                    .insert(name, child.mnum())
                    .is_none();
                if inserted {
                    child.inc_links();
                }
            }
        }
        dir.initialized.store(true, Ordering::SeqCst);
    }

    /// 文件 mnode 首次被访问时，用磁盘上的文件大小初始化内存大小，
    /// 以便区分按需加载与新页分配。
    fn initialize_file(&self, m: &Arc<Mnode>) {
        let file = m.as_file();
        if file.initialized.load(Ordering::SeqCst) {
            return;
        }
        let mut cache = file.pages.lock().unwrap();
        if file.initialized.load(Ordering::SeqCst) {
            return;
        }
        if let Some(inum) = self.inum_lookup(m.mnum()) {
            let ip = iget(self, inum);
            cache.size = ip.size.load(Ordering::SeqCst) as u64;
        }
        file.initialized.store(true, Ordering::SeqCst);
    }

    /// 从磁盘读入文件的一页。
    fn load_file_page(&self, mnum: Mnum, page_idx: u32) -> Box<[u8; BSIZE]> {
        let mut data = Box::new([0u8; BSIZE]);
        if let Some(inum) = self.inum_lookup(mnum) {
            let ip = iget(self, inum);
            let pos = page_idx * BSIZE as u32;
            let disk_size = ip.size.load(Ordering::SeqCst);
            if pos < disk_size {
                let guard = ip.ilock_read();
                readi(self, &ip, &mut data[..], pos).expect("load_file_page");
                drop(guard);
            }
        }
        data
    }

    // ------------------------------------------------------------------
    // 元数据操作

    fn dir_mnode(&self, mnum: Mnum) -> Result<Arc<Mnode>> {
        let m = self.mnodes.get(mnum).ok_or(FsError::NotFound)?;
        if !m.is_dir() {
            return Err(FsError::InvalidArg);
        }
        self.initialize_dir(&m);
        Ok(m)
    }

    fn plain_name(name: &str) -> Result<DirName> {
        let name = DirName::new(name)?;
        if name.is_dot() || name.is_dotdot() {
            return Err(FsError::InvalidArg);
        }
        Ok(name)
    }

    /// 在目录下创建一个新对象，返回它的 mnum。
    ///
    /// 对象与名字只出现在内存里；create 记录进对象自己的日志，
    /// link 记录进父目录的日志，持久化推迟到 fsync。
    pub fn create(&self, parent: Mnum, name: &str, mtype: MnodeType) -> Result<Mnum> {
        self.create_inner(parent, name, mtype, 0, 0)
    }

    /// 创建设备节点。
    pub fn mknod(&self, parent: Mnum, name: &str, major: u16, minor: u16) -> Result<Mnum> {
        self.create_inner(parent, name, MnodeType::Dev, major, minor)
    }

    fn create_inner(
        &self,
        parent: Mnum,
        name: &str,
        mtype: MnodeType,
        major: u16,
        minor: u16,
    ) -> Result<Mnum> {
        let name = Self::plain_name(name)?;
        let pm = self.dir_mnode(parent)?;

        let m = self.mnodes.alloc(new_kind(mtype, major, minor), 1);
        self.alloc_metadata_log(m.mnum());
        self.alloc_mnode_lock(m.mnum());

        {
            let mut entries = pm.as_dir().entries.lock();
            if entries.contains_key(&name) {
                drop(entries);
                // 输掉了命名竞争，撤销刚登记的对象
                self.free_metadata_log(m.mnum());
                self.free_mnode_lock(m.mnum());
                self.mnodes.remove(m.mnum());
                return Err(FsError::InvalidArg);
            }
            entries.insert(name, m.mnum());
        }

        match m.mtype() {
            MnodeType::Dir => {
                m.as_dir().parent.store(parent, Ordering::SeqCst);
                m.as_dir().initialized.store(true, Ordering::SeqCst);
            }
            MnodeType::File => {
                m.as_file().initialized.store(true, Ordering::SeqCst);
            }
            MnodeType::Dev => {}
        }

        // create 先于 link，两条记录的时间戳顺序即依赖顺序
        let ts = self.next_tsc();
        self.log_for(m.mnum()).add_operation(Operation {
            timestamp: ts,
            kind: OpKind::Create {
                mnum: m.mnum(),
                parent,
                mtype,
            },
        });
        let ts = self.next_tsc();
        self.log_for(parent).add_operation(Operation {
            timestamp: ts,
            kind: OpKind::Link {
                parent,
                name,
                mnum: m.mnum(),
                mtype,
            },
        });

        Ok(m.mnum())
    }

    /// 为已有对象建立一个新名字（硬链接）。目录不可硬链接。
    pub fn link(&self, parent: Mnum, name: &str, mnum: Mnum) -> Result<()> {
        let name = Self::plain_name(name)?;
        let pm = self.dir_mnode(parent)?;
        let target = self.mnodes.get(mnum).ok_or(FsError::NotFound)?;
        if target.is_dir() {
            return Err(FsError::InvalidArg);
        }

        {
            let mut entries = pm.as_dir().entries.lock();
            if entries.contains_key(&name) {
                return Err(FsError::InvalidArg);
            }
            entries.insert(name, mnum);
        }
        target.inc_links();

        let ts = self.next_tsc();
        self.log_for(parent).add_operation(Operation {
            timestamp: ts,
            kind: OpKind::Link {
                parent,
                name,
                mnum,
                mtype: target.mtype(),
            },
        });
        Ok(())
    }

    /// 删除目录里的一个名字。目录要求为空。
    ///
    /// 对象失去最后一个名字且没有打开引用时，delete 记录进它自己的
    /// 日志，对象离开 mnode 表；仍有打开引用时推迟到最后一次
    /// [`ScaleFs::mput`]。
    pub fn unlink(&self, parent: Mnum, name: &str) -> Result<()> {
        let name = Self::plain_name(name)?;
        let pm = self.dir_mnode(parent)?;

        let mnum = {
            let entries = pm.as_dir().entries.lock();
            *entries.get(&name).ok_or(FsError::NotFound)?
        };
        let target = self.mnodes.get(mnum).ok_or(FsError::NotFound)?;

        if target.is_dir() {
            self.initialize_dir(&target);
            if !target.as_dir().entries.lock().is_empty() {
                return Err(FsError::InvalidArg);
            }
        }

        pm.as_dir().entries.lock().remove(&name);

        let ts = self.next_tsc();
        self.log_for(parent).add_operation(Operation {
            timestamp: ts,
            kind: OpKind::Unlink {
                parent,
                name,
                mnum,
            },
        });

        if target.dec_links() == 0 {
            self.maybe_delete_mnode(&target);
        }
        Ok(())
    }

    /// 链接数与打开引用都归零的对象：记 delete、出表。
    fn maybe_delete_mnode(&self, m: &Arc<Mnode>) {
        if m.links() == 0 && m.opens() == 0 {
            let ts = self.next_tsc();
            if let Some(log) = self.try_log_for(m.mnum()) {
                log.add_operation(Operation {
                    timestamp: ts,
                    kind: OpKind::Delete { mnum: m.mnum() },
                });
            }
            self.mnodes.remove(m.mnum());
        }
    }

    /// 重命名 `src_parent/name` 为 `dst_parent/newname`。
    ///
    /// # 功能说明
    /// 跨目录移动时重命名的两半共享同一时间戳：链接半操作进目标
    /// 父目录的日志，解链半操作进源父目录的日志，fsync 解析到任何
    /// 一半都会把另一半拉进同一个事务。移动目录还会在目标父链的
    /// 每个祖先日志里放置重命名屏障，强制先冲刷父辈；目录移动到
    /// 自己的子树下被拒绝。同目录改名没有跨日志配对问题，记为一对
    /// 普通的 link/unlink。
    ///
    /// # 可能的错误
    /// - 源名字不存在：[`FsError::NotFound`]；
    /// - 新名字被一个目录占用、或把目录移进自己的子树：
    ///   [`FsError::InvalidArg`]。
    /// 新名字被一个文件占用时视作覆盖，旧文件按解链处理。
    pub fn rename(
        &self,
        src_parent: Mnum,
        name: &str,
        dst_parent: Mnum,
        newname: &str,
    ) -> Result<()> {
        let name = Self::plain_name(name)?;
        let newname = Self::plain_name(newname)?;
        let src_m = self.dir_mnode(src_parent)?;
        let dst_m = self.dir_mnode(dst_parent)?;

        let mnum = {
            let entries = src_m.as_dir().entries.lock();
            *entries.get(&name).ok_or(FsError::NotFound)?
        };
        let target = self.mnodes.get(mnum).ok_or(FsError::NotFound)?;
        let dir_move = target.is_dir();

        // 目录移动全局串行化，保证环检查与屏障铺设期间父链稳定
        let _rename_guard = if dir_move {
            Some(self.rename_lock.lock().unwrap())
        } else {
            None
        };

        if dir_move && src_parent != dst_parent {
            let mut cur = dst_parent;
            loop {
                if cur == mnum {
                    return Err(FsError::InvalidArg);
                }
                if cur == self.root_mnum() {
                    break;
                }
                let Some(c) = self.mnodes.get(cur) else { break };
                cur = c.as_dir().parent.load(Ordering::SeqCst);
            }
        }

        if src_parent == dst_parent && name == newname {
            return Ok(());
        }

        // 摘旧名、挂新名；新名字被文件占用时按覆盖解链
        let existing = dst_m.as_dir().entries.lock().get(&newname).copied();
        let mut replaced: Option<Arc<Mnode>> = None;
        if let Some(old) = existing {
            if old != mnum {
                let old_m = self.mnodes.get(old).ok_or(FsError::NotFound)?;
                if old_m.is_dir() {
                    return Err(FsError::InvalidArg);
                }
                replaced = Some(old_m);
            }
        }
        src_m.as_dir().entries.lock().remove(&name);
        dst_m.as_dir().entries.lock().insert(newname, mnum);
        if let Some(old) = replaced {
            if old.dec_links() == 0 {
                self.maybe_delete_mnode(&old);
            }
        }
        if dir_move {
            target.as_dir().parent.store(dst_parent, Ordering::SeqCst);
        }

        if dir_move && src_parent != dst_parent {
            // 从目标父目录一路到根，每个祖先放一个屏障
            let mut cur = dst_parent;
            loop {
                let parent = if cur == self.root_mnum() {
                    cur
                } else {
                    self.mnodes
                        .get(cur)
                        .map(|c| c.as_dir().parent.load(Ordering::SeqCst))
                        .unwrap_or(cur)
                };
                let ts = self.next_tsc();
                if let Some(log) = self.try_log_for(cur) {
                    log.add_operation(Operation {
                        timestamp: ts,
                        kind: OpKind::RenameBarrier { mnum: cur, parent },
                    });
                }
                if cur == self.root_mnum() {
                    break;
                }
                cur = parent;
            }
        }

        if src_parent == dst_parent {
            let ts = self.next_tsc();
            self.log_for(dst_parent).add_operation(Operation {
                timestamp: ts,
                kind: OpKind::Link {
                    parent: dst_parent,
                    name: newname,
                    mnum,
                    mtype: target.mtype(),
                },
            });
            let ts = self.next_tsc();
            self.log_for(src_parent).add_operation(Operation {
                timestamp: ts,
                kind: OpKind::Unlink {
                    parent: src_parent,
                    name,
                    mnum,
                },
            });
        } else {
            // 两半共享一个时间戳，这是配对的唯一凭据
            let ts = self.next_tsc();
            self.log_for(dst_parent).add_operation(Operation {
                timestamp: ts,
                kind: OpKind::RenameLink {
                    src_parent,
                    dst_parent,
                    newname,
                    mnum,
                    mtype: target.mtype(),
                },
            });
            self.log_for(src_parent).add_operation(Operation {
                timestamp: ts,
                kind: OpKind::RenameUnlink {
                    src_parent,
                    dst_parent,
                    name,
                    mnum,
                },
            });
        }

        Ok(())
    }

    /// 在目录里查找一个名字。
    pub fn lookup(&self, dir_mnum: Mnum, name: &str) -> Result<Mnum> {
        let name = DirName::new(name)?;
        let m = self.dir_mnode(dir_mnum)?;
        let result = m.as_dir()
            .entries
            .lock()
            .get(&name)
            .copied()
            .ok_or(FsError::NotFound);
        result
    }

    /// 打开引用：对象存在时增加打开计数并返回它。
    pub fn mget(&self, mnum: Mnum) -> Option<Arc<Mnode>> {
        let m = self.mnodes.get(mnum)?;
        m.inc_opens();
        Some(m)
    }

    /// 释放打开引用。失去最后一个引用且已无链接的对象就此消亡。
    pub fn mput(&self, mnum: Mnum) {
        if let Some(m) = self.mnodes.get(mnum) {
            if m.dec_opens() == 0 {
                self.maybe_delete_mnode(&m);
            }
        }
    }

    /// 对象状态快照。磁盘侧字段经无锁的序号校验读取。
    pub fn stat(&self, mnum: Mnum) -> Result<Stat> {
        let m = self.mnodes.get(mnum).ok_or(FsError::NotFound)?;
        let mut size = match m.mtype() {
            MnodeType::File => {
                self.initialize_file(&m);
                m.as_file().pages.lock().unwrap().size
            }
            _ => 0,
        };

        let (inum, nlink, gen) = match self.inum_lookup(mnum) {
            Some(inum) => {
                let ip = iget(self, inum);
                let st = istat(&ip);
                debug_assert_eq!(st.itype, m.mtype().to_itype());
                if m.mtype() == MnodeType::Dir {
                    size = st.size as u64;
                }
                (Some(inum), st.nlink, st.gen)
            }
            None => (None, 0, 0),
        };

        Ok(Stat {
            mtype: m.mtype(),
            size,
            links: m.links(),
            inum,
            nlink,
            gen,
        })
    }

    // ------------------------------------------------------------------
    // 文件内容

    /// 经页缓存写文件。页按需从磁盘装载，写过的页记脏，
    /// fsync 时写回。
    pub fn write_file(&self, mnum: Mnum, off: u64, data: &[u8]) -> Result<usize> {
        let m = self.mnodes.get(mnum).ok_or(FsError::NotFound)?;
        if m.mtype() != MnodeType::File {
            return Err(FsError::InvalidArg);
        }
        self.initialize_file(&m);

        let end = off.checked_add(data.len() as u64).ok_or(FsError::InvalidArg)?;
        if end > MAX_FILE_SIZE as u64 {
            return Err(FsError::InvalidArg);
        }

        let file = m.as_file();
        let mut cache = file.pages.lock().unwrap();
        let mut written = 0usize;
        let mut pos = off;
        while written < data.len() {
            let page_idx = (pos / BSIZE as u64) as u32;
            let page_off = (pos % BSIZE as u64) as usize;
            let n = (data.len() - written).min(BSIZE - page_off);

            if !cache.pages.contains_key(&page_idx) {
                let loaded = self.load_file_page(mnum, page_idx);
                cache.pages.insert(
                    page_idx,
                    mnode::Page {
                        data: loaded,
                        dirty: false,
                    },
                );
            }
            let page = cache.pages.get_mut(&page_idx).unwrap();
            page.data[page_off..page_off + n].copy_from_slice(&data[written..written + n]);
            page.dirty = true;

            written += n;
            pos += n as u64;
        }
        if end > cache.size {
            cache.size = end;
        }
        Ok(written)
    }

    /// 经页缓存读文件，到文件尾截断。
    pub fn read_file(&self, mnum: Mnum, off: u64, out: &mut [u8]) -> Result<usize> {
        let m = self.mnodes.get(mnum).ok_or(FsError::NotFound)?;
        if m.mtype() != MnodeType::File {
            return Err(FsError::InvalidArg);
        }
        self.initialize_file(&m);

        let file = m.as_file();
        let mut cache = file.pages.lock().unwrap();
        if off >= cache.size {
            return Ok(0);
        }
        let n = out.len().min((cache.size - off) as usize);

        let mut read = 0usize;
        let mut pos = off;
        while read < n {
            let page_idx = (pos / BSIZE as u64) as u32;
            let page_off = (pos % BSIZE as u64) as usize;
            let step = (n - read).min(BSIZE - page_off);

            if !cache.pages.contains_key(&page_idx) {
                let loaded = self.load_file_page(mnum, page_idx);
                cache.pages.insert(
                    page_idx,
                    mnode::Page {
                        data: loaded,
                        dirty: false,
                    },
                );
            }
            let page = cache.pages.get(&page_idx).unwrap();
            out[read..read + step].copy_from_slice(&page.data[page_off..page_off + step]);

            read += step;
            pos += step as u64;
        }
        Ok(n)
    }

    /// 把文件的脏页写回磁盘（绕过日志），大小更新与新分配的块
    /// 构成一个子事务排队，由本次 fsync 的聚合提交。
    fn sync_file(&self, m: &Arc<Mnode>, ts: u64) {
        let file = m.as_file();
        if !file.initialized.load(Ordering::SeqCst) {
            return;
        }
        if self.inum_lookup(m.mnum()).is_none() {
            return;
        }

        let mut cache = file.pages.lock().unwrap();
        let size = cache.size;
        let ip = self.get_inode(m.mnum(), "sync_file");
        let has_dirty = cache.pages.values().any(|p| p.dirty);
        if !has_dirty && ip.size.load(Ordering::SeqCst) as u64 == size {
            return;
        }

        let mut tr = Transaction::new(ts);
        let guard = ip.ilock_write();
        for (idx, page) in cache.pages.iter_mut() {
            if !page.dirty {
                continue;
            }
            let pos = *idx as u64 * BSIZE as u64;
            if pos >= size {
                page.dirty = false;
                continue;
            }
            let n = (BSIZE as u64).min(size - pos) as usize;
            writei(self, &ip, &page.data[..n], pos as u32, Some(&mut tr), true)
                .expect("sync_file: writei");
            page.dirty = false;
        }
        update_size(self, &ip, size as u32, &mut tr);
        drop(guard);
        drop(cache);

        self.add_fsync_to_journal(tr);
    }

    // ------------------------------------------------------------------
    // fsync 与缓存开关

    /// 把对象（及其依赖闭包）在时间戳上限以内的全部操作持久化。
    ///
    /// 返回时，目标日志里时间戳不超过上限的记录、经依赖边可达的
    /// 记录、以及文件的脏页都已提交并回写完成。
    pub fn fsync(&self, mnum: Mnum) -> Result<()> {
        if self.mnodes.get(mnum).is_none() && self.try_log_for(mnum).is_none() {
            return Err(FsError::NotFound);
        }

        let max_tsc = self.next_tsc();
        self.process_metadata_log(max_tsc, mnum);

        if let Some(m) = self.mnodes.get(mnum) {
            if m.mtype() == MnodeType::File {
                self.sync_file(&m, self.next_tsc());
            }
        }

        let mut jr = self.journal.lock().unwrap();
        self.flush_journal_locked(&mut jr);
        Ok(())
    }

    /// 缓存逐出开关（设备文件协议）：写入 `b"1"` 丢弃缓冲区缓存里的
    /// 干净块，写入 `b"2"` 丢弃页缓存里的干净页。返回写入的字节数。
    pub fn evict_caches(&self, buf: &[u8]) -> usize {
        if buf.len() != 1 {
            log::warn!("evict_caches: invalid number of characters ({})", buf.len());
            return buf.len();
        }
        match buf[0] {
            b'1' => self.evict_bufcache(),
            b'2' => self.evict_pagecache(),
            c => log::warn!("evict_caches: invalid option {}", c as char),
        }
        buf.len()
    }

    fn evict_bufcache(&self) {
        log::info!("evict_caches: dropping buffer-cache blocks");
        let inums: Vec<(u32, Mnum)> = self
            .inum_to_mnum
            .lock()
            .iter()
            .map(|(i, m)| (*i, *m))
            .collect();
        for (inum, mnum) in inums {
            let is_file = self
                .mnodes
                .get(mnum)
                .map_or(false, |m| m.mtype() == MnodeType::File);
            if is_file {
                let ip = iget(self, inum);
                let guard = ip.ilock_read();
                inode::drop_bufcache(self, &ip);
                drop(guard);
            }
        }
    }

    fn evict_pagecache(&self) {
        log::info!("evict_caches: dropping page-cache pages");
        for mnum in self.mnodes.mnums() {
            if let Some(m) = self.mnodes.get(mnum) {
                if m.mtype() == MnodeType::File {
                    m.drop_pagecache();
                }
            }
        }
    }

    /// 块统计设备的读出内容：空闲块数的文本快照。
    pub fn free_block_stats(&self) -> String {
        format!(
            "Num free blocks: {} / {}\n",
            self.balloc().free_count(),
            self.balloc().total()
        )
    }

    /// 当前空闲数据块数量。
    pub fn free_blocks(&self) -> usize {
        self.balloc().free_count()
    }
}
