//! 条件变量
//!
//! 基于计数信号量和等待者计数实现，需配合外部的 [`SpinLock`] 使用。
//! 等待者计数在唤醒方持锁时递减，而不是在被唤醒者恢复运行时递减，
//! 因此 `signal` 与 `wait` 之间不会丢失唤醒。

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::semaphore::Semaphore;
use crate::spinlock::SpinLockGuard;

pub struct CondVar {
    /// 只在持有外部锁时修改
    waiters: AtomicUsize,
    sem: Semaphore,
}

impl CondVar {
    pub fn new() -> Self {
        Self {
            waiters: AtomicUsize::new(0),
            sem: Semaphore::new(0),
        }
    }

    /// 释放 `guard` 对应的锁并挂起，被唤醒后重新获取该锁。
    ///
    /// # 流程解释
    /// 1. 等待者计数加一（此时仍持有外部锁）；
    /// 2. 释放外部锁；
    /// 3. 在信号量上等待；
    /// 4. 重新获取外部锁并返回新的守卫。
    ///
    /// 返回后条件未必成立，调用者应在循环中重新检查。
    pub fn wait<'a, T: ?Sized>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let lock = guard.spinlock();
        self.waiters.fetch_add(1, Ordering::Relaxed);
        drop(guard);
        self.sem.down();
        lock.lock()
    }

    /// 唤醒一个等待者。调用者应持有与 `wait` 相同的外部锁。
    pub fn signal(&self) {
        let waiters = self.waiters.load(Ordering::Relaxed);
        if waiters > 0 {
            self.waiters.store(waiters - 1, Ordering::Relaxed);
            self.sem.up();
        }
    }

    /// 唤醒调用时已登记的全部等待者。
    pub fn broadcast(&self) {
        let waiters = self.waiters.swap(0, Ordering::Relaxed);
        for _ in 0..waiters {
            self.sem.up();
        }
    }

    /// 已登记且尚未被唤醒的等待者数量。
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
