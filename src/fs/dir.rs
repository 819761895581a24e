//! 目录索引层
//!
//! 磁盘上的目录是定长目录项的紧凑数组，`inum == 0` 表示该槽位已
//! 删除；槽位从不压缩，偏移保持稳定，内存索引据此把名字映射到
//! `(inum, offset)`。新目录项总是追加在 `dir_offset` 处。

use core::mem;
use std::sync::Mutex;

use std::collections::HashMap;

use crate::consts::{BSIZE, DIRSIZ};
use crate::error::{FsError, Result};

use super::inode::{iget, iupdate, readi, writei, Inode, InodeSlot, InodeType};
use super::transaction::Transaction;
use super::ScaleFs;

/// 目录项在磁盘上的布局。
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct DirEntry {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

pub(crate) const DIRENT_SIZE: usize = mem::size_of::<DirEntry>();

impl DirEntry {
    pub(crate) fn new(inum: u16, name: &DirName) -> Self {
        Self {
            inum,
            name: name.0,
        }
    }

    pub(crate) fn to_bytes(&self) -> [u8; DIRENT_SIZE] {
        let mut out = [0u8; DIRENT_SIZE];
        out[..2].copy_from_slice(&self.inum.to_ne_bytes());
        out[2..].copy_from_slice(&self.name);
        out
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        let mut name = [0u8; DIRSIZ];
        name.copy_from_slice(&bytes[2..DIRENT_SIZE]);
        Self {
            inum: u16::from_ne_bytes(bytes[..2].try_into().unwrap()),
            name,
        }
    }
}

/// 定长、零填充的目录项名字。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct DirName(pub [u8; DIRSIZ]);

impl DirName {
    /// 由字符串构造名字；空名、超长名或含 `/`、NUL 的名字非法。
    pub(crate) fn new(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > DIRSIZ {
            return Err(FsError::PathComponent);
        }
        if bytes.iter().any(|&b| b == b'/' || b == 0) {
            return Err(FsError::PathComponent);
        }
        let mut buf = [0u8; DIRSIZ];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub(crate) fn dotdot() -> Self {
        let mut buf = [0u8; DIRSIZ];
        buf[0] = b'.';
        buf[1] = b'.';
        Self(buf)
    }

    pub(crate) fn is_dot(&self) -> bool {
        self.0[0] == b'.' && self.0[1] == 0
    }

    pub(crate) fn is_dotdot(&self) -> bool {
        self.0[0] == b'.' && self.0[1] == b'.' && self.0[2] == 0
    }

    pub(crate) fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        core::str::from_utf8(&self.0[..len]).unwrap_or("?")
    }
}

#[derive(Clone, Copy)]
pub(crate) struct DirEntryInfo {
    pub inum: u32,
    pub offset: u32,
}

/// 目录 inode 的内存索引。
pub(crate) struct DirIndex {
    inner: Mutex<DirIndexInner>,
}

struct DirIndexInner {
    map: HashMap<DirName, DirEntryInfo>,
    /// 下一个追加槽位的偏移。
    dir_offset: u32,
}

impl DirIndex {
    pub(crate) fn lookup(&self, name: &DirName) -> Option<DirEntryInfo> {
        self.inner
            .lock()
            .unwrap()
            .map
            .get(name)
            .copied()
            .filter(|info| info.inum != 0)
    }

    /// 遍历当前有效目录项的快照。
    pub(crate) fn entries(&self) -> Vec<(DirName, DirEntryInfo)> {
        self.inner
            .lock()
            .unwrap()
            .map
            .iter()
            .filter(|(_, info)| info.inum != 0)
            .map(|(n, info)| (*n, *info))
            .collect()
    }
}

/// 首次访问时从磁盘重建目录的内存索引。
///
/// 顺序扫描目录的数据块，把 `inum != 0` 的目录项放进映射，
/// `dir_offset` 停在文件末尾（删除槽位也占据偏移）。
pub(crate) fn dir_init<'a>(fs: &ScaleFs, dp: &'a InodeSlot) -> &'a DirIndex {
    if dp.itype() != InodeType::Directory {
        panic!("dir_init: inode {} not a directory", dp.inum);
    }
    dp.dir.call_once(|| {
        let mut map = HashMap::new();
        let size = dp.size.load(core::sync::atomic::Ordering::SeqCst);
        let mut block = [0u8; BSIZE];
        let mut dir_offset = 0u32;

        let mut off = 0u32;
        while off < size {
            let n = readi(fs, dp, &mut block, off).expect("dir_init: read dir block");
            for chunk in block[..n].chunks_exact(DIRENT_SIZE) {
                let de = DirEntry::from_bytes(chunk);
                if de.inum != 0 {
                    map.insert(
                        DirName(de.name),
                        DirEntryInfo {
                            inum: de.inum as u32,
                            offset: dir_offset,
                        },
                    );
                }
                dir_offset += DIRENT_SIZE as u32;
            }
            off += n as u32;
            if n == 0 {
                break;
            }
        }

        DirIndex {
            inner: Mutex::new(DirIndexInner { map, dir_offset }),
        }
    })
}

/// 在目录中查找名字对应的 inode。
pub(crate) fn dirlookup(fs: &ScaleFs, dp: &InodeSlot, name: &DirName) -> Option<Inode> {
    let index = dir_init(fs, dp);
    index.lookup(name).map(|info| iget(fs, info.inum))
}

/// 把内存索引中名字对应的目录项写到磁盘上它的稳定偏移处。
fn dir_flush_entry(fs: &ScaleFs, dp: &InodeSlot, name: &DirName, tr: &mut Transaction) {
    let index = dir_init(fs, dp);
    let info = {
        let inner = index.inner.lock().unwrap();
        *inner.map.get(name).expect("dir_flush_entry: name not indexed")
    };

    let de = DirEntry::new(info.inum as u16, name);
    let written = writei(fs, dp, &de.to_bytes(), info.offset, Some(tr), false)
        .expect("dir_flush_entry: write");
    if written != DIRENT_SIZE {
        panic!("dir_flush_entry: short write");
    }

    let end = info.offset + DIRENT_SIZE as u32;
    if dp.size.load(core::sync::atomic::Ordering::SeqCst) < end {
        let _w = dp.seq.write_begin();
        dp.size.store(end, core::sync::atomic::Ordering::SeqCst);
    }
    iupdate(fs, dp, Some(tr));
}

/// 向目录写入一个新的目录项 `(name, inum)`。
///
/// # 功能说明
/// 在 `dir_offset` 处追加目录项并更新内存索引；目标 inode 的链接数
/// 加一（`..` 项除外）并写回；`inc_parent_link` 为真时目录自身的
/// 链接数也加一（子目录通过 `..` 引用本目录的惯例计数）。
/// 目录项与受影响的 inode 都进入事务。
///
/// # 可能的错误
/// 同名目录项已存在时返回 [`FsError::InvalidArg`]。
pub(crate) fn dirlink(
    fs: &ScaleFs,
    dp: &InodeSlot,
    name: &DirName,
    inum: u32,
    inc_parent_link: bool,
    tr: &mut Transaction,
) -> Result<()> {
    if inum > u16::MAX as u32 {
        panic!("dirlink: inum {} too large", inum);
    }
    let index = dir_init(fs, dp);

    {
        let mut inner = index.inner.lock().unwrap();
        if inner.map.get(name).map_or(false, |info| info.inum != 0) {
            return Err(FsError::InvalidArg);
        }
        let offset = inner.dir_offset;
        inner.map.insert(
            *name,
            DirEntryInfo {
                inum,
                offset,
            },
        );
        inner.dir_offset = offset + DIRENT_SIZE as u32;
    }

    if !name.is_dotdot() {
        let target = iget(fs, inum);
        let guard = target.ilock_write();
        target.link();
        iupdate(fs, &target, Some(tr));
        drop(guard);
    }
    if inc_parent_link {
        dp.link();
    }

    dir_flush_entry(fs, dp, name, tr);
    Ok(())
}

/// 从目录中删除目录项 `(name, inum)`。
///
/// 磁盘上该槽位的 inum 清零（偏移保留），目标 inode 链接数减一
/// （`..` 项除外），`dec_parent_link` 为真时目录自身链接数减一。
pub(crate) fn dirunlink(
    fs: &ScaleFs,
    dp: &InodeSlot,
    name: &DirName,
    inum: u32,
    dec_parent_link: bool,
    tr: &mut Transaction,
) -> Result<()> {
    let index = dir_init(fs, dp);

    {
        let mut inner = index.inner.lock().unwrap();
        let info = inner.map.get_mut(name).ok_or(FsError::NotFound)?;
        if info.inum == 0 {
            return Err(FsError::NotFound);
        }
        debug_assert_eq!(info.inum, inum, "dirunlink: stale inum for {}", name.as_str());
        info.inum = 0;
    }

    // 写出 inum 为零的墓碑记录
    dir_flush_entry(fs, dp, name, tr);

    if !name.is_dotdot() {
        let target = iget(fs, inum);
        let guard = target.ilock_write();
        target.unlink();
        iupdate(fs, &target, Some(tr));
        drop(guard);
    }
    if dec_parent_link {
        dp.unlink();
        iupdate(fs, dp, Some(tr));
    }

    index.inner.lock().unwrap().map.remove(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirent_is_packed() {
        assert_eq!(DIRENT_SIZE, 16);
        let name = DirName::new("hello").unwrap();
        let de = DirEntry::new(7, &name);
        let round = DirEntry::from_bytes(&de.to_bytes());
        assert_eq!(round.inum, 7);
        assert_eq!(round.name, name.0);
    }

    #[test]
    fn dirname_rejects_bad_components() {
        assert!(DirName::new("").is_err());
        assert!(DirName::new("a/b").is_err());
        assert!(DirName::new("abcdefghijklmno").is_err());
        assert!(DirName::new("abcdefghijklmn").is_ok());
    }

    #[test]
    fn dot_and_dotdot() {
        assert!(DirName::dotdot().is_dotdot());
        assert!(DirName::new(".").unwrap().is_dot());
        assert!(!DirName::new("..x").unwrap().is_dotdot());
    }
}
