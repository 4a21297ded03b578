//! 睡眠锁模块
//! 提供基于挂起/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的线程会在条件变量上挂起，避免忙等待。
//! 块缓存用它保护块数据，持锁期间允许进行磁盘 I/O。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::condvar::CondVar;
use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`状态的访问
/// - `locked`: 表示锁是否已被占用
/// - `cv`: 等待该锁的线程在此挂起
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: AtomicBool,
    cv: CondVar,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub fn new(data: T) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: AtomicBool::new(false),
            cv: CondVar::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能挂起当前线程）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：在条件变量上等待，醒来后重新检查
    ///   - 如果未锁定：设置`locked=true`
    /// 3. 释放内部自旋锁并返回守卫
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.lock.lock();
        while self.locked.load(Ordering::Relaxed) {
            guard = self.cv.wait(guard);
        }
        self.locked.store(true, Ordering::Relaxed);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 锁当前是否被某个线程持有
    pub fn is_locked(&self) -> bool {
        let _guard = self.lock.lock();
        self.locked.load(Ordering::Relaxed)
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    fn unlock(&self) {
        let guard = self.lock.lock();
        self.locked.store(false, Ordering::Relaxed);
        self.cv.signal();
        drop(guard);
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 守卫离开作用域时自动释放锁并唤醒一个等待者。
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
    use std::time::Duration;

    #[test]
    fn guard_gives_exclusive_access() {
        let lock = SleepLock::new(vec![0u8; 4]);
        {
            let mut guard = lock.lock();
            assert!(lock.is_locked());
            guard[0] = 7;
        }
        assert!(!lock.is_locked());
        assert_eq!(lock.lock()[0], 7);
    }

    #[test]
    fn contended_holders_are_serialized() {
        const THREADS: usize = 6;
        const ROUNDS: usize = 200;

        let lock = Arc::new(SleepLock::new((0usize, false)));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let mut guard = lock.lock();
                        assert!(!guard.1, "two holders inside the sleep lock");
                        guard.1 = true;
                        guard.0 += 1;
                        thread::yield_now();
                        guard.1 = false;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.lock().0, THREADS * ROUNDS);
    }

    #[test]
    fn waiter_blocks_until_release() {
        let lock = Arc::new(SleepLock::new(0u32));
        let guard = lock.lock();

        let handle = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || *lock.lock())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());
        drop(guard);
        assert_eq!(handle.join().unwrap(), 0);
    }
}
