//! 内存对象层
//!
//! mnode 是文件系统对象在内存中的形态，按类型携带各自的负载：
//! 文件带按块粒度的页缓存，目录带名字到 mnum 的映射和弱父引用
//! （父引用只是裸 mnum，经表解析，避免环状所有权）。mnode 表拥有
//! 所有 mnode；打开引用与内存链接数是显式计数，二者都归零的对象
//! 在其 delete 记录进入日志后离开表。

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use spin::Mutex as SpinLock;

use crate::consts::BSIZE;

use super::dir::DirName;
use super::inode::InodeType;

/// 内存文件系统对象的进程内唯一编号。
pub type Mnum = u64;

/// mnode 的类型。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MnodeType {
    File,
    Dir,
    Dev,
}

impl MnodeType {
    pub(crate) fn to_itype(self) -> InodeType {
        match self {
            MnodeType::File => InodeType::File,
            MnodeType::Dir => InodeType::Directory,
            MnodeType::Dev => InodeType::Device,
        }
    }

    pub(crate) fn from_itype(itype: InodeType) -> Option<Self> {
        match itype {
            InodeType::File => Some(MnodeType::File),
            InodeType::Directory => Some(MnodeType::Dir),
            InodeType::Device => Some(MnodeType::Dev),
            InodeType::Empty => None,
        }
    }
}

/// 文件内容的一页（与块同粒度）。
pub(crate) struct Page {
    pub data: Box<[u8; BSIZE]>,
    pub dirty: bool,
}

/// 文件 mnode 的页缓存与内存大小。
pub(crate) struct PageCache {
    pub pages: BTreeMap<u32, Page>,
    pub size: u64,
}

pub(crate) struct MFile {
    pub pages: Mutex<PageCache>,
    /// 首次访问时从磁盘大小初始化，用于区分按需加载与新页分配。
    pub initialized: AtomicBool,
}

pub(crate) struct MDir {
    pub entries: SpinLock<HashMap<DirName, Mnum>>,
    /// 父目录的 mnum；根目录指向自身。
    pub parent: AtomicU64,
    pub initialized: AtomicBool,
}

pub(crate) struct MDev {
    pub major: u16,
    pub minor: u16,
}

pub(crate) enum MnodeKind {
    File(MFile),
    Dir(MDir),
    Dev(MDev),
}

/// 一个内存文件系统对象。
pub struct Mnode {
    mnum: Mnum,
    /// 指向本对象的目录项数量（内存视角）。
    links: AtomicU32,
    /// 显式打开引用计数；不为零时 inode 的磁盘回收被推迟。
    open_count: AtomicU32,
    pub(crate) kind: MnodeKind,
}

impl Mnode {
    pub fn mnum(&self) -> Mnum {
        self.mnum
    }

    pub fn mtype(&self) -> MnodeType {
        match self.kind {
            MnodeKind::File(_) => MnodeType::File,
            MnodeKind::Dir(_) => MnodeType::Dir,
            MnodeKind::Dev(_) => MnodeType::Dev,
        }
    }

    pub(crate) fn as_file(&self) -> &MFile {
        match &self.kind {
            MnodeKind::File(f) => f,
            _ => panic!("mnode {}: not a file", self.mnum),
        }
    }

    pub(crate) fn as_dir(&self) -> &MDir {
        match &self.kind {
            MnodeKind::Dir(d) => d,
            _ => panic!("mnode {}: not a directory", self.mnum),
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        matches!(self.kind, MnodeKind::Dir(_))
    }

    pub(crate) fn links(&self) -> u32 {
        self.links.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_links(&self) {
        self.links.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_links(&self) -> u32 {
        let old = self.links.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "mnode {}: link count below zero", self.mnum);
        old - 1
    }

    pub(crate) fn opens(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_opens(&self) {
        self.open_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_opens(&self) -> u32 {
        let old = self.open_count.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "mnode {}: open count below zero", self.mnum);
        old - 1
    }

    /// 丢弃页缓存中的干净页；脏页保留，等待下一次 fsync。
    pub(crate) fn drop_pagecache(&self) {
        let file = self.as_file();
        if !file.initialized.load(Ordering::SeqCst) {
            return;
        }
        let mut cache = file.pages.lock().unwrap();
        cache.pages.retain(|_, page| page.dirty);
    }
}

pub(crate) fn new_kind(mtype: MnodeType, major: u16, minor: u16) -> MnodeKind {
    match mtype {
        MnodeType::File => MnodeKind::File(MFile {
            pages: Mutex::new(PageCache {
                pages: BTreeMap::new(),
                size: 0,
            }),
            initialized: AtomicBool::new(false),
        }),
        MnodeType::Dir => MnodeKind::Dir(MDir {
            entries: SpinLock::new(HashMap::new()),
            parent: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }),
        MnodeType::Dev => MnodeKind::Dev(MDev { major, minor }),
    }
}

/// mnode 表：拥有全部存活的 mnode。
pub(crate) struct MnodeTable {
    map: SpinLock<HashMap<Mnum, Arc<Mnode>>>,
    next_mnum: AtomicU64,
}

impl MnodeTable {
    pub(crate) fn new() -> Self {
        Self {
            map: SpinLock::new(HashMap::new()),
            next_mnum: AtomicU64::new(1),
        }
    }

    /// 创建并登记一个新的 mnode，初始链接数为 `links`。
    pub(crate) fn alloc(&self, kind: MnodeKind, links: u32) -> Arc<Mnode> {
        let mnum = self.next_mnum.fetch_add(1, Ordering::SeqCst);
        let m = Arc::new(Mnode {
            mnum,
            links: AtomicU32::new(links),
            open_count: AtomicU32::new(0),
            kind,
        });
        self.map.lock().insert(mnum, Arc::clone(&m));
        m
    }

    pub(crate) fn get(&self, mnum: Mnum) -> Option<Arc<Mnode>> {
        self.map.lock().get(&mnum).cloned()
    }

    pub(crate) fn remove(&self, mnum: Mnum) {
        self.map.lock().remove(&mnum);
    }

    /// 当前表内所有 mnum 的快照。
    pub(crate) fn mnums(&self) -> Vec<Mnum> {
        self.map.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_alloc_assigns_unique_mnums(){
        let table = MnodeTable::new();
        let a = table.alloc(new_kind(MnodeType::File, 0, 0), 1);
        let b = table.alloc(new_kind(MnodeType::Dir, 0, 0), 1);
        assert_ne!(a.mnum(), b.mnum());
        assert!(table.get(a.mnum()).is_some());
        table.remove(a.mnum());
        assert!(table.get(a.mnum()).is_none());
    }

    #[test]
    fn drop_pagecache_keeps_dirty_pages() {
        let table = MnodeTable::new();
        let m = table.alloc(new_kind(MnodeType::File, 0, 0), 1);
        m.as_file().initialized.store(true, Ordering::SeqCst);
        {
            let mut cache = m.as_file().pages.lock().unwrap();
            cache.pages.insert(
                0,
                Page {
                    data: Box::new([0; BSIZE]),
                    dirty: false,
                },
            );
            cache.pages.insert(
                1,
                Page {
                    data: Box::new([0; BSIZE]),
                    dirty: true,
                },
            );
        }
        m.drop_pagecache();
        let cache = m.as_file().pages.lock().unwrap();
        assert!(!cache.pages.contains_key(&0));
        assert!(cache.pages.contains_key(&1));
    }
}
