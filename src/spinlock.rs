//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。
//!
//! 自旋锁只用于短临界区（缓存元数据、日志状态），持锁期间不得进行磁盘 I/O。

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

/// 为每个线程分配一个非零编号，用于记录锁的持有者。
pub(crate) fn thread_id() -> usize {
    static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
    thread_local! {
        static ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

/// 表示一个自旋锁结构，用于在多线程环境下保护共享数据。
///
/// `SpinLock` 通过忙等待实现互斥。锁同时记录持有者的线程编号，
/// 同一线程重复获取会被视为死锁并直接 panic。
///
/// # 字段说明
/// - `lock`: 锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和 panic 信息；
/// - `holder`: 当前持有锁的线程编号（0 表示无人持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    holder: AtomicUsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            holder: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 示例
    /// ```
    /// use xv6_bcache::spinlock::SpinLock;
    ///
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// assert_eq!(*lock.lock(), 42);
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 检查当前线程是否持有此锁。
    pub fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed) && self.holder.load(Ordering::Relaxed) == thread_id()
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 检查是否已持有锁（防止自死锁）；
    /// 2. 使用原子比较交换（CAS）忙等待获取锁；
    /// 3. 获取成功后设置内存屏障；
    /// 4. 记录当前线程编号。
    fn acquire(&self) {
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        self.holder.store(thread_id(), Ordering::Relaxed);
    }

    /// 释放锁的核心实现，由守卫的`Drop`调用。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.holder.store(0, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 守卫所属的自旋锁，供条件变量在等待后重新加锁。
    pub(crate) fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁。
    fn drop(&mut self) {
        self.lock.release();
    }
}
