//! 错误类型
//!
//! 可恢复错误以 [`FsError`] 的形式沿调用链传播；
//! 不变量被破坏（重复释放块、解锁未加锁的 inode、未知的日志槽类型等）
//! 属于致命错误，直接 panic 并附带诊断信息。

use core::fmt;

/// 文件系统操作的可恢复错误类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// 块分配器耗尽。调用者可在冲刷日志后重试。
    OutOfBlocks,
    /// 与并发的淘汰或分配竞争失败，调用者应重新发起本次操作。
    Retry,
    /// 查找失败。
    NotFound,
    /// 路径分量非法（过长或为空）。
    PathComponent,
    /// 参数非法：错误的偏移、类型或标志。
    InvalidArg,
    /// 设备 I/O 未在限定时间内完成。
    DeviceTimeout,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::OutOfBlocks => "out of blocks",
            FsError::Retry => "concurrent eviction, retry",
            FsError::NotFound => "not found",
            FsError::PathComponent => "bad path component",
            FsError::InvalidArg => "invalid argument",
            FsError::DeviceTimeout => "device timeout",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for FsError {}

pub type Result<T> = core::result::Result<T, FsError>;
