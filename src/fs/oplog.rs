//! 逐对象操作日志
//!
//! 每个存活的 mnum 对应一条逻辑日志。记录按线程槽位写入各自的
//! 分区（记录在分区自旋锁内一次性成形，原实现中的 start/end 时间戳
//! 区间因此收拢为一点）；解析器在日志外层锁的保护下调用
//! [`MfsLog::synchronize_upto_tsc`]，把各分区中时间戳不超过上限的
//! 记录归并进全序向量。两次归并之间分区只增不减。

use array_macro::array;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use spin::Mutex as SpinLock;

use crate::consts::NCPU;

use super::dir::DirName;
use super::mnode::{MnodeType, Mnum};

/// 当前线程的日志分区槽位。线程首次使用时轮转分配。
pub(crate) fn my_cpu() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static SLOT: usize = NEXT.fetch_add(1, Ordering::Relaxed) % NCPU;
    }
    SLOT.with(|s| *s)
}

/// 一条元数据操作记录。时间戳全局唯一且单调；一次重命名的两半
/// 共享同一时间戳。
#[derive(Clone, Debug)]
pub(crate) struct Operation {
    pub timestamp: u64,
    pub kind: OpKind,
}

#[derive(Clone, Debug)]
pub(crate) enum OpKind {
    /// mnum 在磁盘上尚无对应 inode，需要创建。记录在 mnum 自己的日志里。
    Create {
        mnum: Mnum,
        parent: Mnum,
        mtype: MnodeType,
    },
    /// 父目录获得一个指向 mnum 的名字。记录在父目录的日志里。
    Link {
        parent: Mnum,
        name: DirName,
        mnum: Mnum,
        mtype: MnodeType,
    },
    /// 父目录失去一个指向 mnum 的名字。
    Unlink {
        parent: Mnum,
        name: DirName,
        mnum: Mnum,
    },
    /// 重命名屏障：在 mnum 的日志中出现，要求先把其父目录冲刷到
    /// 本时间戳，再继续处理 mnum 之后的记录。
    RenameBarrier { mnum: Mnum, parent: Mnum },
    /// 重命名的链接半操作，记录在目标父目录的日志里。
    RenameLink {
        src_parent: Mnum,
        dst_parent: Mnum,
        newname: DirName,
        mnum: Mnum,
        mtype: MnodeType,
    },
    /// 重命名的解链半操作，记录在源父目录的日志里。
    RenameUnlink {
        src_parent: Mnum,
        dst_parent: Mnum,
        name: DirName,
        mnum: Mnum,
    },
    /// mnum 的最后一个链接与最后一个打开引用都已消失。
    Delete { mnum: Mnum },
}

impl OpKind {
    /// 本记录归属（描述）的 mnum，吸收路径用它给记录分组。
    pub(crate) fn subject(&self) -> Mnum {
        match *self {
            OpKind::Create { mnum, .. }
            | OpKind::Link { mnum, .. }
            | OpKind::Unlink { mnum, .. }
            | OpKind::RenameLink { mnum, .. }
            | OpKind::RenameUnlink { mnum, .. }
            | OpKind::Delete { mnum } => mnum,
            OpKind::RenameBarrier { mnum, .. } => mnum,
        }
    }
}

/// 已归并部分的状态，由外层互斥锁保护。持有锁的解析器可以在
/// 应用记录的同时安全地增删向量头部。
pub(crate) struct LogState {
    pub ops: VecDeque<Operation>,
}

/// 一个 mnum 的逻辑日志。
pub(crate) struct MfsLog {
    loggers: [SpinLock<Vec<Operation>>; NCPU],
    state: Mutex<LogState>,
}

impl MfsLog {
    pub(crate) fn new() -> Self {
        Self {
            loggers: array![_ => SpinLock::new(Vec::new()); NCPU],
            state: Mutex::new(LogState {
                ops: VecDeque::new(),
            }),
        }
    }

    /// 把一条记录追加到当前线程的分区。
    pub(crate) fn add_operation(&self, op: Operation) {
        self.loggers[my_cpu()].lock().push(op);
    }

    /// 取得日志的外层锁。解析器在整个处理期间持有它。
    pub(crate) fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap()
    }

    /// 把所有分区中时间戳不超过 `max_tsc` 的记录并入全序向量。
    ///
    /// 调用者必须持有外层锁（以 `state` 守卫为凭）。归并后的向量
    /// 整体按时间戳重排，保证跨分区的全序。
    pub(crate) fn synchronize_upto_tsc(&self, state: &mut LogState, max_tsc: u64) {
        let mut moved = false;
        for logger in &self.loggers {
            let mut pending = logger.lock();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].timestamp <= max_tsc {
                    state.ops.push_back(pending.remove(i));
                    moved = true;
                } else {
                    i += 1;
                }
            }
        }
        if moved {
            let mut sorted: Vec<Operation> = state.ops.drain(..).collect();
            sorted.sort_by_key(|op| op.timestamp);
            state.ops.extend(sorted);
        }
    }

}

/// 吸收（absorb）：对一批已全序化的记录做净效果剪枝。
/// 未接入 fsync 解析路径（见下），当前仅作为离线批处理工具。
///
/// # 功能说明
/// 同一 mnum 的 create 与 delete 同时在批内出现时，两次持久状态
/// 之间的净外部可见效果为零，该 mnum 的 create、link、unlink、
/// rename 半操作与 delete 全部剪除。没有对应 create 的 delete
/// 不触发吸收（此前的持久状态里对象存在，删除必须落盘）。
///
/// 本过程与 fsync 解析路径是分离的：解析器沿链接依赖边拉取 create
/// 记录，吸收若先一步抹掉它们会让依赖悬空。
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) fn absorb(ops: Vec<Operation>) -> Vec<Operation> {
    use std::collections::HashMap;

    struct OpIdx {
        create: Option<usize>,
        others: Vec<usize>,
    }

    let mut index: HashMap<Mnum, OpIdx> = HashMap::new();
    let mut erase: Vec<usize> = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        let mnum = op.kind.subject();
        let entry = index.entry(mnum).or_insert(OpIdx {
            create: None,
            others: Vec::new(),
        });
        match op.kind {
            OpKind::Create { .. } => {
                if entry.create.is_some() {
                    panic!("absorb: multiple creates for mnode {}", mnum);
                }
                entry.create = Some(i);
            }
            OpKind::Delete { .. } => {
                // 只有同批存在 create 时才吸收
                if let Some(c) = entry.create.take() {
                    erase.push(c);
                    erase.append(&mut entry.others);
                    erase.push(i);
                }
            }
            OpKind::RenameBarrier { .. } => {}
            _ => entry.others.push(i),
        }
    }

    erase.sort_unstable_by(|a, b| b.cmp(a));
    let mut ops = ops;
    for i in erase {
        ops.remove(i);
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(ts: u64, kind: OpKind) -> Operation {
        Operation {
            timestamp: ts,
            kind,
        }
    }

    fn create(ts: u64, mnum: Mnum) -> Operation {
        op(
            ts,
            OpKind::Create {
                mnum,
                parent: 1,
                mtype: MnodeType::File,
            },
        )
    }

    fn link(ts: u64, mnum: Mnum) -> Operation {
        op(
            ts,
            OpKind::Link {
                parent: 1,
                name: DirName::new("x").unwrap(),
                mnum,
                mtype: MnodeType::File,
            },
        )
    }

    fn delete(ts: u64, mnum: Mnum) -> Operation {
        op(ts, OpKind::Delete { mnum })
    }

    #[test]
    fn merge_orders_across_partitions() {
        let log = MfsLog::new();
        // 绕开线程槽位，直接往不同分区塞记录
        log.loggers[0].lock().push(create(5, 2));
        log.loggers[1].lock().push(link(3, 2));
        log.loggers[2].lock().push(link(9, 2));

        let mut state = log.lock();
        log.synchronize_upto_tsc(&mut state, 6);
        let ts: Vec<u64> = state.ops.iter().map(|o| o.timestamp).collect();
        assert_eq!(ts, vec![3, 5]);

        // 上限之外的记录留在分区里，下次归并补齐
        log.synchronize_upto_tsc(&mut state, 10);
        let ts: Vec<u64> = state.ops.iter().map(|o| o.timestamp).collect();
        assert_eq!(ts, vec![3, 5, 9]);
    }

    #[test]
    fn absorb_cancels_create_delete_group() {
        let ops = vec![create(1, 7), link(2, 7), link(3, 8), delete(4, 7)];
        let left = absorb(ops);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, 3);
    }

    #[test]
    fn absorb_keeps_delete_without_create() {
        let ops = vec![link(2, 7), delete(4, 7)];
        let left = absorb(ops);
        assert_eq!(left.len(), 2);
    }
}
