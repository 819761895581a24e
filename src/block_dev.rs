//! 块设备接口层
//!
//! 核心对设备的全部要求：按字节偏移的同步读写，以及一个
//! 只有在此前所有已确认的写入都落盘之后才返回的 `flush`。

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use crate::consts::BSIZE;
use crate::error::{FsError, Result};

/// 底层块设备。实现者负责把 I/O 错误映射为 [`FsError::DeviceTimeout`]；
/// 核心把设备错误视为请求路径上的致命错误。
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

/// 内存盘，用于测试与崩溃模拟：丢弃 [`crate::ScaleFs`] 上下文后在同一个
/// `MemDisk` 上重新装载，只有已写回设备的内容会留存。
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; nblocks * BSIZE]),
        }
    }

    /// 复制当前盘上内容，得到一个独立的盘。
    pub fn snapshot(&self) -> Self {
        Self {
            data: Mutex::new(self.data.lock().unwrap().clone()),
        }
    }

    pub fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    /// 盘上全部字节的副本，用于比较两块盘的状态。
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BlockDevice for MemDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return Err(FsError::DeviceTimeout);
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return Err(FsError::DeviceTimeout);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// 文件盘：把一个普通文件当作块设备。
pub struct FileDisk(pub Mutex<File>);

impl BlockDevice for FileDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| FsError::DeviceTimeout)?;
        file.read_exact(buf).map_err(|_| FsError::DeviceTimeout)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| FsError::DeviceTimeout)?;
        file.write_all(buf).map_err(|_| FsError::DeviceTimeout)
    }

    fn flush(&self) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .sync_all()
            .map_err(|_| FsError::DeviceTimeout)
    }
}
