//! 依赖解析器
//!
//! fsync 的核心：给定目标 mnum 和时间戳上限，沿逐对象日志行走，
//! 追踪跨对象依赖边（链接要求目标先创建；重命名有两半；重命名屏障
//! 携带父目录依赖），把相关记录线性化为一串子事务交给物理日志。
//! 解析器绝不在无关记录之间引入顺序。
//!
//! 悬而未决的工作保存在三个栈上：待处理对象栈 `(mnum, max_tsc, count)`
//! （`count == -1` 表示处理到上限为止，`count == 1` 是"只处理该对象的
//! create 记录"的特殊指令）、重命名栈与重命名屏障栈。

use std::sync::Arc;

use crate::consts::NRECLAIM_INODES;

use super::dir::{dirlink, dirlookup, dirunlink, DirName};
use super::inode::{free_inode, iget, itrunc, iupdate, Inode, InodeType};
use super::mnode::{MnodeType, Mnum};
use super::oplog::{LogState, MfsLog, OpKind, Operation};
use super::transaction::Transaction;
use super::ScaleFs;

/// `process_ops_from_oplog` 的返回值。
enum OpStep {
    /// 处理完了（给定日志中上限以内的记录都已应用）。
    Done,
    /// 碰到链接操作，被链接对象的 create 已压入待处理栈。
    Link,
    /// 碰到重命名屏障，其父目录已压入待处理栈。
    Barrier,
    /// 碰到新的重命名半操作，其对侧目录已压入待处理栈。
    SubOp,
    /// 拿到了重命名半操作的对侧，凑成一对。
    Pair,
}

#[derive(Clone, Copy)]
struct PendingEntry {
    mnum: Mnum,
    max_tsc: u64,
    count: i32,
}

struct RenameEntry {
    src_parent: Mnum,
    dst_parent: Mnum,
    timestamp: u64,
}

struct BarrierEntry {
    mnum: Mnum,
    timestamp: u64,
}

impl ScaleFs {
    /// 应用目标对象逻辑日志中时间戳不超过 `max_tsc` 的全部记录，
    /// 以及经依赖边可达的记录。由 fsync 调用。
    pub(crate) fn process_metadata_log(&self, max_tsc: u64, mnum: Mnum) {
        let mut pending = vec![PendingEntry {
            mnum,
            max_tsc,
            count: -1,
        }];
        let mut renames: Vec<RenameEntry> = Vec::new();
        let mut barriers: Vec<BarrierEntry> = Vec::new();

        while let Some(pm) = pending.last().copied() {
            // 待处理栈上的对象必须仍持有逻辑日志；查不到说明解析器
            // 丢了依赖，属于不变量被破坏，log_for 直接带诊断 panic
            let log = self.log_for(pm.mnum);

            let step = {
                let mut state = log.lock();
                self.process_ops_from_oplog(
                    &log,
                    &mut state,
                    pm,
                    &mut pending,
                    &mut renames,
                    &mut barriers,
                )
            };

            match step {
                OpStep::Done => {
                    pending.pop();
                }
                OpStep::Link | OpStep::Barrier | OpStep::SubOp => continue,
                // 凑齐一对重命名半操作：拿齐两个目录的日志锁，把两半
                // 原子地应用进同一个子事务，然后弹出刚压入的对侧依赖。
                OpStep::Pair => {
                    self.apply_rename_pair(&mut renames);
                    pending.pop();
                }
            }
        }

        assert!(
            renames.is_empty() && barriers.is_empty(),
            "resolver: dangling rename state after fsync"
        );
    }

    /// 归并给定日志到 `pm.max_tsc`，然后按时间戳顺序逐条处理记录。
    ///
    /// # 流程解释
    /// - create/unlink/delete（以及目标已持久化的 link）：立即应用为
    ///   一个子事务并从日志中移除；
    /// - 目标尚无磁盘 inode 的 link：把 `(被链接对象, 链接时间戳, 1)`
    ///   压入待处理栈并返回 [`OpStep::Link`]；
    /// - 重命名屏障：根对象的屏障直接丢弃；与屏障栈顶匹配说明父目录
    ///   已处理过，弹栈丢记录继续；否则压入父目录依赖并返回
    ///   [`OpStep::Barrier`]；
    /// - 重命名半操作：压入对侧目录依赖；时间戳与重命名栈顶相同则
    ///   返回 [`OpStep::Pair`]，否则返回 [`OpStep::SubOp`]。
    fn process_ops_from_oplog(
        &self,
        log: &MfsLog,
        state: &mut LogState,
        pm: PendingEntry,
        pending: &mut Vec<PendingEntry>,
        renames: &mut Vec<RenameEntry>,
        barriers: &mut Vec<BarrierEntry>,
    ) -> OpStep {
        log.synchronize_upto_tsc(state, pm.max_tsc);

        if state.ops.is_empty() {
            return OpStep::Done;
        }

        // count == 1 的特殊指令：只处理该对象的 create 记录
        if pm.count == 1 {
            if matches!(state.ops.front().map(|op| &op.kind), Some(OpKind::Create { .. })) {
                let op = state.ops.pop_front().unwrap();
                self.add_op_to_journal(op);
            }
            return OpStep::Done;
        }

        let mut count = if pm.count < 0 {
            state.ops.len() as i64
        } else {
            pm.count as i64
        };

        while count > 0 {
            let Some(front) = state.ops.front().cloned() else {
                break;
            };

            match front.kind {
                OpKind::Link { mnum, .. } if self.inum_lookup(mnum).is_none() => {
                    // 被链接对象还没有磁盘 inode，先把它的 create 作为依赖
                    pending.push(PendingEntry {
                        mnum,
                        max_tsc: front.timestamp,
                        count: 1,
                    });
                    return OpStep::Link;
                }

                OpKind::RenameBarrier { mnum, parent } => {
                    if mnum == self.root_mnum() {
                        state.ops.pop_front();
                        count -= 1;
                        continue;
                    }
                    if let Some(top) = barriers.last() {
                        if top.mnum == mnum && top.timestamp == front.timestamp {
                            // 父目录已处理过
                            barriers.pop();
                            state.ops.pop_front();
                            count -= 1;
                            continue;
                        }
                    }
                    barriers.push(BarrierEntry {
                        mnum,
                        timestamp: front.timestamp,
                    });
                    pending.push(PendingEntry {
                        mnum: parent,
                        max_tsc: front.timestamp,
                        count: -1,
                    });
                    return OpStep::Barrier;
                }

                OpKind::RenameLink {
                    src_parent,
                    dst_parent,
                    ..
                }
                | OpKind::RenameUnlink {
                    src_parent,
                    dst_parent,
                    ..
                } => {
                    // 是否是已知的最新重命名的对侧？
                    let last_ts = renames.last().map(|r| r.timestamp).unwrap_or(0);

                    renames.push(RenameEntry {
                        src_parent,
                        dst_parent,
                        timestamp: front.timestamp,
                    });
                    // 手头是哪一半，就把另一半所在的目录作为依赖压栈
                    let counterpart = match front.kind {
                        OpKind::RenameLink { .. } => src_parent,
                        _ => dst_parent,
                    };
                    pending.push(PendingEntry {
                        mnum: counterpart,
                        max_tsc: front.timestamp,
                        count: -1,
                    });

                    if last_ts != 0 && front.timestamp == last_ts {
                        return OpStep::Pair;
                    }
                    return OpStep::SubOp;
                }

                _ => {
                    let op = state.ops.pop_front().unwrap();
                    self.add_op_to_journal(op);
                }
            }
            count -= 1;
        }

        OpStep::Done
    }

    /// 把重命名栈顶的一对半操作原子地应用为一个子事务。
    ///
    /// # 流程解释
    /// 锁顺序固定为先源目录日志、后目标目录日志（相同则只取一次）。
    /// 拿到两把锁后重新检查两个日志头——并发的 fsync 可能已经把这对
    /// 半操作冲刷掉了。两半构成单个事务排队，然后从各自日志移除。
    fn apply_rename_pair(&self, renames: &mut Vec<RenameEntry>) {
        let rm1 = renames.pop().expect("rename stack underflow");
        let rm2 = renames.pop().expect("rename stack underflow");
        // 时间戳全局唯一，两半属于同一次重命名当且仅当时间戳相等
        assert_eq!(
            rm1.timestamp, rm2.timestamp,
            "rename halves out of step"
        );
        let ts = rm1.timestamp;
        let src_mnum = rm1.src_parent;
        let dst_mnum = rm1.dst_parent;

        // 两个父目录的日志必须都在；半途丢一个就等于把一对重命名
        // 半操作从日志里抹掉却谎报成功，必须当场倒下
        let src_log = self.log_for(src_mnum);
        let dst_log = if dst_mnum != src_mnum {
            Some(self.log_for(dst_mnum))
        } else {
            None
        };

        let mut src_state = src_log.lock();
        let mut dst_state = dst_log.as_ref().map(|l| l.lock());

        src_log.synchronize_upto_tsc(&mut src_state, ts);
        if let (Some(log), Some(state)) = (dst_log.as_ref(), dst_state.as_mut()) {
            log.synchronize_upto_tsc(state, ts);
        }

        let link_matches = {
            let dst = dst_state.as_deref().unwrap_or(&src_state);
            matches!(
                dst.ops.front(),
                Some(Operation { timestamp, kind: OpKind::RenameLink { .. } }) if *timestamp == ts
            )
        };
        let unlink_matches = matches!(
            src_state.ops.front(),
            Some(Operation { timestamp, kind: OpKind::RenameUnlink { .. } }) if *timestamp == ts
        );
        if !link_matches || !unlink_matches {
            return;
        }

        let link_op = match dst_state.as_mut() {
            Some(state) => state.ops.pop_front().unwrap(),
            None => src_state.ops.pop_front().unwrap(),
        };
        let unlink_op = src_state.ops.pop_front().unwrap();

        // 两半必须落进同一个事务，保住重命名的原子性
        let mut tr = Transaction::new(ts);
        let mut jr = self.journal.lock().unwrap();
        self.apply_op(&link_op, &mut tr);
        self.apply_op(&unlink_op, &mut tr);
        jr.add_transaction_locked(tr);
    }

    /// 为一条记录开一个子事务，应用后排进物理日志的待提交队列。
    fn add_op_to_journal(&self, op: Operation) {
        let mut tr = Transaction::new(op.timestamp);
        let mut jr = self.journal.lock().unwrap();
        self.apply_op(&op, &mut tr);
        jr.add_transaction_locked(tr);
    }

    /// 把一条逻辑记录翻译成磁盘层的动作。
    fn apply_op(&self, op: &Operation, tr: &mut Transaction) {
        match &op.kind {
            OpKind::Create {
                mnum,
                parent,
                mtype,
            } => {
                self.create_file_dir_if_new(*mnum, *parent, *mtype, tr);
            }
            OpKind::Link {
                parent,
                name,
                mnum,
                mtype,
            } => {
                self.create_directory_entry(*parent, name, *mnum, *mtype, tr);
            }
            OpKind::Unlink { parent, name, .. } => {
                self.unlink_old_inode(*parent, name, tr);
            }
            OpKind::RenameLink {
                src_parent,
                dst_parent,
                newname,
                mnum,
                mtype,
            } => {
                self.mfs_rename_link(*src_parent, *dst_parent, newname, *mnum, *mtype, tr);
            }
            OpKind::RenameUnlink {
                src_parent, name, ..
            } => {
                self.unlink_old_inode(*src_parent, name, tr);
            }
            OpKind::Delete { mnum } => {
                if let Some(inum) = self.inum_lookup(*mnum) {
                    let ip = iget(self, inum);
                    if ip.nlink() == 0 {
                        self.delete_old_inode(*mnum, tr);
                    }
                    // 磁盘上还有目录项指着它：删除交给相应父目录的
                    // unlink 记录，本记录作废
                } else {
                    // 从未持久化就消亡的对象：净效果为零，只回收日志与锁
                    self.free_metadata_log(*mnum);
                    self.free_mnode_lock(*mnum);
                }
            }
            OpKind::RenameBarrier { .. } => {
                panic!("apply_op: rename barrier is never applied")
            }
        }
    }

    /// mnum 在磁盘上还没有 inode 时创建一个。返回 inode 编号。
    ///
    /// 新建目录需要先知道父目录的 inode 编号（`..` 指向它）；
    /// 父目录自己也还没有 inode 时先为它分配。
    fn create_file_dir_if_new(
        &self,
        mnum: Mnum,
        parent_mnum: Mnum,
        mtype: MnodeType,
        tr: &mut Transaction,
    ) -> u32 {
        let mut parent_inum = 0;
        if mtype == MnodeType::Dir {
            parent_inum = match self.inum_lookup(parent_mnum) {
                Some(i) => i,
                None => {
                    self.alloc_inode_for_mnode(parent_mnum, InodeType::Directory)
                        .inum
                }
            };
        }

        let ip = self.alloc_inode_for_mnode(mnum, mtype.to_itype());
        match mtype {
            MnodeType::File | MnodeType::Dev => {
                if mtype == MnodeType::Dev {
                    if let Some(m) = self.mnodes.get(mnum) {
                        if let super::mnode::MnodeKind::Dev(dev) = &m.kind {
                            ip.set_devnum(dev.major, dev.minor);
                        }
                    }
                }
                let guard = ip.ilock_write();
                iupdate(self, &ip, Some(tr));
                drop(guard);
            }
            MnodeType::Dir => {
                let guard = ip.ilock_write();
                // dirlink 内部会做 iupdate；inode 若是早先作为父目录
                // 预创建出来的，".." 可能已经存在
                let _ = dirlink(self, &ip, &DirName::dotdot(), parent_inum, false, tr);
                drop(guard);
            }
        }
        ip.inum
    }

    /// 为内存中存在、磁盘上还没有的名字创建目录项。
    fn create_directory_entry(
        &self,
        mdir_mnum: Mnum,
        name: &DirName,
        dirent_mnum: Mnum,
        mtype: MnodeType,
        tr: &mut Transaction,
    ) {
        let mdir_i = self.get_inode(mdir_mnum, "create_directory_entry");
        let dirent_inum = self
            .inum_lookup(dirent_mnum)
            .unwrap_or_else(|| panic!("create_directory_entry: no inode for mnode {}", dirent_mnum));

        // 目录项已存在？
        if let Some(existing) = dirlookup(self, &mdir_i, name) {
            if existing.inum == dirent_inum {
                return;
            }
            // 名字现在指向别的 inode，先解链旧的给新映射腾位置
            self.unlink_old_inode(mdir_mnum, name, tr);
        }

        let guard = mdir_i.ilock_write();
        dirlink(
            self,
            &mdir_i,
            name,
            dirent_inum,
            mtype == MnodeType::Dir,
            tr,
        )
        .expect("create_directory_entry: dirlink");
        drop(guard);
    }

    /// 删除磁盘上已不存在于内存目录里的目录项。
    ///
    /// 目标的链接数归零后，视打开引用情况立即删除 inode，或把它
    /// 登记进超级块的延迟回收列表推迟到下次启动。
    fn unlink_old_inode(&self, mdir_mnum: Mnum, name: &DirName, tr: &mut Transaction) {
        let dir_i = self.get_inode(mdir_mnum, "unlink_old_inode");
        let Some(target) = dirlookup(self, &dir_i, name) else {
            return;
        };

        {
            let guard = dir_i.ilock_write();
            let dec_parent = target.itype() == InodeType::Directory;
            dirunlink(self, &dir_i, name, target.inum, dec_parent, tr)
                .expect("unlink_old_inode: dirunlink");
            drop(guard);
        }

        if target.nlink() == 0 {
            match self.mnum_for_inum(target.inum) {
                Some(mnum) => {
                    // 打开引用与尚未冲刷的内存链接都算持有者：磁盘上的
                    // 链接数归零不代表对象真的没有名字了
                    let busy = self
                        .mnodes
                        .get(mnum)
                        .map_or(0, |m| m.opens() + m.links());
                    if busy > 0 {
                        // 磁盘 inode 暂不能删，登记到回收列表推迟到重启
                        self.defer_inode_reclaim(target.inum);
                    } else {
                        self.delete_old_inode(mnum, tr);
                    }
                }
                None => {
                    // 没有内存映射（例如回收路径）：直接截断并释放
                    let guard = target.ilock_write();
                    itrunc(self, &target, 0, tr);
                    drop(guard);
                    free_inode(self, &target, tr);
                }
            }
        }
    }

    /// 把 inode 连同文件内容从磁盘上删掉，并回收该 mnum 的
    /// 日志、睡眠锁与编号映射。
    fn delete_old_inode(&self, mnum: Mnum, tr: &mut Transaction) {
        let ip = self.get_inode(mnum, "delete_old_inode");

        {
            let guard = ip.ilock_write();
            itrunc(self, &ip, 0, tr);
            drop(guard);
        }

        self.mnum_to_inum.lock().remove(&mnum);
        self.inum_to_mnum.lock().remove(&ip.inum);
        self.free_metadata_log(mnum);
        self.free_mnode_lock(mnum);
        self.mnodes.remove(mnum);
        free_inode(self, &ip, tr);

        // 该 inode 若曾登记过延迟回收，撤销登记；否则重启回收会
        // 误伤此后复用同一编号的 inode
        let mut reclaim = self.sb.reclaim();
        let mut changed = false;
        for i in 0..reclaim.count as usize {
            if reclaim.inums[i] == ip.inum {
                reclaim.inums[i] = 0;
                changed = true;
            }
        }
        if changed {
            self.sb.write_back(&self.bcache, &reclaim);
        }
    }

    /// 重命名的链接半操作：在目标父目录里建立新名字；跨目录移动的
    /// 目录还要把它的 `..` 从源父目录改指到目标父目录。
    fn mfs_rename_link(
        &self,
        src_parent: Mnum,
        dst_parent: Mnum,
        newname: &DirName,
        mnum: Mnum,
        mtype: MnodeType,
        tr: &mut Transaction,
    ) {
        self.create_directory_entry(dst_parent, newname, mnum, mtype, tr);

        if mtype == MnodeType::Dir && dst_parent != src_parent {
            let mnode_inum = self
                .inum_lookup(mnum)
                .expect("rename_link: moved dir has no inode");
            let src_inum = self
                .inum_lookup(src_parent)
                .expect("rename_link: src parent has no inode");
            let dst_inum = self
                .inum_lookup(dst_parent)
                .expect("rename_link: dst parent has no inode");

            let i = iget(self, mnode_inum);
            let guard = i.ilock_write();
            dirunlink(self, &i, &DirName::dotdot(), src_inum, false, tr)
                .expect("rename_link: unlink ..");
            dirlink(self, &i, &DirName::dotdot(), dst_inum, false, tr)
                .expect("rename_link: link ..");
            drop(guard);
        }
    }

    /// 返回 mnum 对应的磁盘 inode 句柄；没有映射是致命错误。
    pub(crate) fn get_inode(&self, mnum: Mnum, what: &str) -> Inode {
        let inum = self
            .inum_lookup(mnum)
            .unwrap_or_else(|| panic!("{}: inode mapping for mnode {} does not exist", what, mnum));
        iget(self, inum)
    }

    pub(crate) fn inum_lookup(&self, mnum: Mnum) -> Option<u32> {
        self.mnum_to_inum.lock().get(&mnum).copied()
    }

    pub(crate) fn mnum_for_inum(&self, inum: u32) -> Option<Mnum> {
        self.inum_to_mnum.lock().get(&inum).copied()
    }

    pub(crate) fn try_log_for(&self, mnum: Mnum) -> Option<Arc<MfsLog>> {
        self.logs.lock().get(&mnum).cloned()
    }

    pub(crate) fn log_for(&self, mnum: Mnum) -> Arc<MfsLog> {
        self.try_log_for(mnum)
            .unwrap_or_else(|| panic!("no metadata log for mnode {}", mnum))
    }

    pub(crate) fn alloc_metadata_log(&self, mnum: Mnum) {
        self.logs.lock().insert(mnum, Arc::new(MfsLog::new()));
    }

    pub(crate) fn free_metadata_log(&self, mnum: Mnum) {
        self.logs.lock().remove(&mnum);
    }

    pub(crate) fn alloc_mnode_lock(&self, mnum: Mnum) {
        self.mnode_locks
            .lock()
            .insert(mnum, Arc::new(crate::sleeplock::SleepLock::new((), "mnode")));
    }

    pub(crate) fn free_mnode_lock(&self, mnum: Mnum) {
        self.mnode_locks.lock().remove(&mnum);
    }

    /// 返回写锁定状态的 inode；mnum 已有映射时复用现有 inode。
    ///
    /// 同一 mnum 的并发创建由逐 mnum 的睡眠锁串行化，
    /// `inum ↔ mnum` 两张映射在锁内一起更新。
    fn alloc_inode_for_mnode(&self, mnum: Mnum, itype: InodeType) -> Inode {
        let lock = self
            .mnode_locks
            .lock()
            .get(&mnum)
            .cloned()
            .unwrap_or_else(|| panic!("no mnode lock for mnode {}", mnum));
        let _guard = lock.lock();

        if let Some(inum) = self.inum_lookup(mnum) {
            return iget(self, inum);
        }

        let ip = super::inode::ialloc(self, itype);
        self.inum_to_mnum.lock().insert(ip.inum, mnum);
        self.mnum_to_inum.lock().insert(mnum, ip.inum);
        ip
    }

    /// 把一个 inode 编号登记进超级块的延迟回收列表并立即持久化。
    pub(crate) fn defer_inode_reclaim(&self, inum: u32) {
        let mut reclaim = self.sb.reclaim();

        if reclaim.count as usize >= NRECLAIM_INODES {
            log::warn!("no space left to mark inodes for deferred deletion");
            return;
        }

        let idx = reclaim.count as usize;
        reclaim.inums[idx] = inum;
        reclaim.count += 1;
        self.sb.write_back(&self.bcache, &reclaim);
    }
}
