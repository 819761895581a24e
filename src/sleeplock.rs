//! 睡眠锁模块
//! 提供可长时间持有的阻塞式同步原语。
//!
//! 当锁被占用时，尝试获取锁的线程进入休眠状态，避免忙等待。
//! 持有者可以在睡眠锁的保护下进行磁盘 I/O。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use std::sync::{Condvar, Mutex};

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的线程会进入休眠状态，
/// 直到锁被释放后被唤醒。适用于可能长时间持有的锁。
///
/// # 字段说明
/// - `locked`: 表示锁是否已被占用，由内部互斥锁保护
/// - `cv`: 锁释放时唤醒等待者的条件变量
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    locked: Mutex<bool>,
    cv: Condvar,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: Mutex::new(false),
            cv: Condvar::new(),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞线程）
    ///
    /// # 功能说明
    /// 尝试获取睡眠锁。如果锁已被占用，当前线程将进入休眠状态，
    /// 直到锁被释放后被唤醒。返回守卫对象提供对数据的访问。
    ///
    /// # 安全性
    /// 通过`UnsafeCell`获取数据指针，由守卫的独占性保证安全访问。
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.locked.lock().unwrap();
        while *guard {
            guard = self.cv.wait(guard).unwrap();
        }
        *guard = true;
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    fn unlock(&self) {
        let mut guard = self.locked.lock().unwrap();
        debug_assert!(*guard, "sleeplock {}: unlock while not locked", self.name);
        *guard = false;
        drop(guard);
        self.cv.notify_all();
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 守卫存在期间表示锁被持有，离开作用域时自动释放并唤醒等待者。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn exclusive_increment() {
        let lock = Arc::new(SleepLock::new(0u64, "test"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let mut guard = lock.lock();
                    *guard += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }
}
