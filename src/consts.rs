//! 文件系统常量

/// 磁盘块大小（字节）。
pub const BSIZE: usize = 512;

/// inode 中直接块的数量。
pub const NDIRECT: usize = 10;

/// 一个间接块可容纳的块号数量。
pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();

/// 单个文件最多占用的数据块数（直接 + 一级间接 + 二级间接）。
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// 单个文件的最大字节数。
pub const MAX_FILE_SIZE: usize = MAXFILE * BSIZE;

/// 每个位图块管理的块数（每块一位）。
pub const BPB: u32 = (BSIZE * 8) as u32;

/// 目录项中名字的最大长度。
pub const DIRSIZ: usize = 14;

/// 缓冲区缓存中的缓冲块数量。
pub const NBUF: usize = 256;

/// 逻辑日志的分区数量；多线程按线程槽位写入各自的分区。
pub const NCPU: usize = 8;

/// 根目录的 inode 编号。
pub const ROOTINUM: u32 = 1;

/// 超级块所在的块号（块 0 保留）。
pub const SUPERBLOCK_NO: u32 = 1;

/// inode 表的起始块号，紧跟在超级块之后。
pub const INODESTART: u32 = 2;

/// 超级块中延迟回收 inode 列表的容量。
pub const NRECLAIM_INODES: usize = 32;

/// 物理日志槽中头部的大小（一个扇区，头部数据不足时补零）。
pub const JHDR_SIZE: usize = 512;

/// 物理日志文件的固定大小（字节）。64 个槽，每槽一个头部加一个数据块。
pub const PHYS_JOURNAL_SIZE: usize = 64 * (JHDR_SIZE + BSIZE);

/// 物理日志文件在根目录下的名字。
pub const JOURNAL_NAME: &str = "sv6journal";
