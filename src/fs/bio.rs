//! 缓存层
//!
//! 块缓存是一个固定容量的槽位表。槽位元数据（块号、引用计数、时间戳）
//! 由一把自旋锁保护，该锁从不跨越磁盘 I/O；块数据由每个槽位各自的睡眠锁保护，
//! 首次加载时持有睡眠锁读取磁盘，从而串行化同一块的并发加载。

use array_macro::array;

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::trace;

use crate::consts::fs::{BSIZE, NBUF};
use crate::driver::{Block, BlockDevice};
use crate::error::{FsError, Result};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// 缓冲区缓存（Buffer Cache）结构体。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池，用于缓存磁盘块数据。
/// 槽位数组按 `NBUF` 一次分配，实际可用的槽位数为挂载时配置的 `capacity`，
/// 槽位按需启用，启用后不再归还；容量用尽后按时间戳回收最近最少使用且未被钉住的槽位。
pub struct Bcache {
    dev: Arc<dyn BlockDevice>,

    /// 可启用的槽位上限，不超过 `NBUF`
    capacity: usize,

    /// 控制槽位元数据的自旋锁。
    ctrl: SpinLock<BufLru>,

    /// 缓冲块数组，每个缓冲块包含块数据和一个睡眠锁。
    bufs: [BufInner; NBUF],
}

impl Bcache {
    /// 创建一个最多缓存 `capacity` 块的缓存。
    ///
    /// `capacity` 必须在 `1..=NBUF` 之内，由挂载流程事先校验。
    pub fn new(dev: Arc<dyn BlockDevice>, capacity: usize) -> Self {
        assert!(capacity >= 1 && capacity <= NBUF, "bcache: capacity {} out of range", capacity);
        Self {
            dev,
            capacity,
            ctrl: SpinLock::new(BufLru::new(), "BufLru"),
            bufs: array![_ => BufInner::new(); NBUF],
        }
    }

    /// 查找或分配一个缓存槽位，并返回持有其睡眠锁的 `Buf`。
    ///
    /// # 流程解释
    /// 1. 持有自旋锁，在已启用的槽位中查找 `blockno`，命中则直接引用该槽位；
    /// 2. 未命中时先启用一个空槽位（容量未满时），否则回收时间戳最小的未钉住槽位，
    ///    回收的槽位被标记为无效；
    /// 3. 没有可用槽位时返回 `FsError::CacheFull`；
    /// 4. 释放自旋锁后再获取槽位的睡眠锁（可能挂起）。
    fn bget(&self, blockno: u32) -> Result<Buf<'_>> {
        let mut ctrl = self.ctrl.lock();

        let index = match ctrl.find_cached(blockno) {
            Some(index) => index,
            None => match ctrl.recycle(blockno, self.capacity) {
                Some(index) => {
                    self.bufs[index].valid.store(false, Ordering::Relaxed);
                    index
                }
                None => return Err(FsError::CacheFull),
            },
        };
        drop(ctrl);

        Ok(Buf {
            index,
            blockno,
            cache: self,
            data: Some(self.bufs[index].data.lock()),
        })
    }

    /// 获取块 `blockno` 的缓冲区，返回时内容有效且调用者独占该块。
    ///
    /// 缓冲区在 `Buf` 被丢弃（或传给 [`Bcache::brelse`]）时释放。
    pub fn bread(&self, blockno: u32) -> Result<Buf<'_>> {
        let mut b = self.bget(blockno)?;
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            trace!("bcache: load block {} into slot {}", blockno, b.index);
            self.dev.read_block(blockno, b.data_mut().as_block_mut())?;
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        Ok(b)
    }

    /// 释放缓冲区：先放开睡眠锁，再递减引用计数。
    pub fn brelse(&self, buf: Buf<'_>) {
        debug_assert!(core::ptr::eq(self, buf.cache));
        drop(buf);
    }

    fn release_slot(&self, index: usize) {
        let mut ctrl = self.ctrl.lock();
        let b = &mut ctrl.inner[index];
        if b.refcnt == 0 {
            panic!("bcache: release of block {} with zero refcnt", b.blockno);
        }
        b.refcnt -= 1;
    }

    /// 当前已启用的槽位数，不超过容量。
    pub fn num_cached(&self) -> usize {
        self.ctrl.lock().len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 块 `blockno` 当前的引用计数；未被缓存时返回 `None`。
    pub fn pin_count(&self, blockno: u32) -> Option<usize> {
        let ctrl = self.ctrl.lock();
        let index = ctrl.position(blockno)?;
        Some(ctrl.inner[index].refcnt)
    }

    /// 按块号释放一次钉住，用于事务放弃时归还日志持有的引用。
    pub(crate) fn unpin_blockno(&self, blockno: u32) {
        let mut ctrl = self.ctrl.lock();
        match ctrl.position(blockno) {
            Some(i) if ctrl.inner[i].refcnt > 0 => ctrl.inner[i].refcnt -= 1,
            _ => panic!("bcache: unpin of unpinned block {}", blockno),
        }
    }

    /// 使块 `blockno` 的缓存副本失效，下次 `bread` 时重新从磁盘加载。
    ///
    /// 用于恢复流程绕过缓存直接写盘之后，以及放弃一批未提交的修改时。
    /// 正持有该块的句柄不受影响，释放后再次读取才会重新加载。
    pub(crate) fn invalidate(&self, blockno: u32) {
        let ctrl = self.ctrl.lock();
        if let Some(i) = ctrl.position(blockno) {
            self.bufs[i].valid.store(false, Ordering::Relaxed);
        }
    }

    pub(crate) fn device(&self) -> &dyn BlockDevice {
        &*self.dev
    }
}

/// 持有睡眠锁的缓冲块句柄。
///
/// 句柄存在期间其槽位的引用计数至少为 1，不会被回收。
pub struct Buf<'a> {
    /// 在缓存数组中的槽位索引
    index: usize,

    blockno: u32,

    cache: &'a Bcache,

    /// 离开作用域前先释放睡眠锁，因此用 `Option` 包装
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &BufData {
        self.data.as_ref().unwrap().deref()
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        self.data.as_mut().unwrap().deref_mut()
    }

    /// 立即把缓冲区内容写回磁盘上的原位置。
    pub fn bwrite(&mut self) -> Result<()> {
        trace!("bcache: write block {}", self.blockno);
        self.cache.dev.write_block(self.blockno, self.data().as_block())?;
        Ok(())
    }

    /// 增加引用计数，使槽位在句柄释放后仍不可回收。
    pub fn pin(&self) {
        let mut ctrl = self.cache.ctrl.lock();
        ctrl.inner[self.index].refcnt += 1;
    }

    /// 撤销一次 [`Buf::pin`]。
    pub fn unpin(&self) {
        let mut ctrl = self.cache.ctrl.lock();
        let rc = ctrl.inner[self.index].refcnt;
        if rc <= 1 {
            panic!("buf unpin not match");
        }
        ctrl.inner[self.index].refcnt = rc - 1;
    }
}

impl<'a> Deref for Buf<'a> {
    type Target = BufData;

    fn deref(&self) -> &BufData {
        self.data()
    }
}

impl<'a> DerefMut for Buf<'a> {
    fn deref_mut(&mut self) -> &mut BufData {
        self.data_mut()
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        drop(self.data.take());
        self.cache.release_slot(self.index);
    }
}

/// 槽位元数据表，下标与 `Bcache::bufs` 一一对应。
struct BufLru {
    inner: [BufCtrl; NBUF],

    /// 已启用的槽位数，`inner[..len]` 为在用槽位
    len: usize,

    /// 逻辑时钟，每次 `bget` 递增
    ticks: u64,
}

impl BufLru {
    fn new() -> Self {
        Self {
            inner: array![_ => BufCtrl::new(); NBUF],
            len: 0,
            ticks: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.ticks += 1;
        self.ticks
    }

    fn position(&self, blockno: u32) -> Option<usize> {
        self.inner[..self.len].iter().position(|b| b.blockno == blockno)
    }

    /// 查找已缓存的块，命中则增加引用计数并刷新时间戳。
    fn find_cached(&mut self, blockno: u32) -> Option<usize> {
        let index = self.position(blockno)?;
        let stamp = self.tick();
        let b = &mut self.inner[index];
        b.refcnt += 1;
        b.stamp = stamp;
        Some(index)
    }

    /// 为 `blockno` 分配槽位：优先启用空槽位，其次回收最近最少使用的未钉住槽位。
    fn recycle(&mut self, blockno: u32, capacity: usize) -> Option<usize> {
        let index = if self.len < capacity {
            self.len += 1;
            self.len - 1
        } else {
            self.inner[..self.len]
                .iter()
                .enumerate()
                .filter(|(_, b)| b.refcnt == 0)
                .min_by_key(|(_, b)| b.stamp)
                .map(|(i, _)| i)?
        };
        let stamp = self.tick();
        let b = &mut self.inner[index];
        b.blockno = blockno;
        b.refcnt = 1;
        b.stamp = stamp;
        Some(index)
    }
}

struct BufCtrl {
    blockno: u32,

    /// 引用计数：持有句柄的调用者数加上日志的钉住数
    refcnt: usize,

    /// 最近一次被 `bget` 选中的逻辑时间
    stamp: u64,
}

impl BufCtrl {
    const fn new() -> Self {
        Self {
            blockno: 0,
            refcnt: 0,
            stamp: 0,
        }
    }
}

struct BufInner {
    /// 数据是否已从磁盘加载
    valid: AtomicBool,

    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new()),
        }
    }
}

/// 一个块大小的数据区，提供带边界检查的字节与整数访问。
#[repr(C, align(8))]
#[derive(Clone)]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }

    pub fn as_block(&self) -> &Block {
        &self.0
    }

    pub fn as_block_mut(&mut self) -> &mut Block {
        &mut self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// 读取字节偏移 `offset` 处的小端 u32。
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    /// 在字节偏移 `offset` 处写入小端 u32。
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.0[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn zero(&mut self) {
        self.0.fill(0);
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}
