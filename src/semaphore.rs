//! 计数信号量
//!
//! 计数值永不为负：没有可用计数时，`down` 的调用者进入等待队列并挂起，
//! `up` 优先把计数直接交给队首的等待者。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::spinlock::SpinLock;

struct Waiter {
    thread: Thread,
    granted: Arc<AtomicBool>,
}

struct SemInner {
    count: usize,
    wait_queue: VecDeque<Waiter>,
}

pub struct Semaphore {
    inner: SpinLock<SemInner>,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            inner: SpinLock::new(
                SemInner {
                    count,
                    wait_queue: VecDeque::new(),
                },
                "semaphore",
            ),
        }
    }

    /// P 操作：取走一个计数，若没有则挂起当前线程直到被 `up` 唤醒。
    pub fn down(&self) {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            return;
        }
        let granted = Arc::new(AtomicBool::new(false));
        inner.wait_queue.push_back(Waiter {
            thread: thread::current(),
            granted: Arc::clone(&granted),
        });
        drop(inner);

        // park 可能被伪唤醒，以 granted 为准
        while !granted.load(Ordering::Acquire) {
            thread::park();
        }
    }

    /// V 操作：唤醒一个等待者，没有等待者时计数加一。
    pub fn up(&self) {
        let mut inner = self.inner.lock();
        let waiter = inner.wait_queue.pop_front();
        match waiter {
            Some(waiter) => {
                drop(inner);
                waiter.granted.store(true, Ordering::Release);
                waiter.thread.unpark();
            }
            None => inner.count += 1,
        }
    }

    /// 当前可用计数（不含等待者）。
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }
}
