//! 可扩展文件系统核心。
//!
//! 内存中的文件系统对象（mnode）把每次元数据操作记录到各自的逻辑日志中，
//! fsync 时由依赖解析器把相关操作线性化为一串子事务，写入崩溃一致的物理日志，
//! 再回写到磁盘上的原始位置。空闲块分配器与上述流程并发运行。
//!
//! 公共入口是 [`ScaleFs`]：通过 [`ScaleFs::mount`] 在一个实现了
//! [`BlockDevice`] 的设备上装载文件系统，所有操作都经由该上下文结构体完成。

#![warn(rust_2018_idioms)]

mod block_dev;
mod consts;
mod error;
mod fs;
mod sleeplock;

pub use block_dev::{BlockDevice, FileDisk, MemDisk};
pub use consts::{BSIZE, DIRSIZ, MAX_FILE_SIZE, PHYS_JOURNAL_SIZE};
pub use error::{FsError, Result};
pub use fs::mkfs::{mkfs, FsGeometry};
pub use fs::mnode::{Mnode, MnodeType, Mnum};
pub use fs::{ScaleFs, Stat};
