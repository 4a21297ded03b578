//! 日志层
//!
//! 日志以整块为单位做重做日志（redo log），磁盘格式：
//!   日志头块：块数 n，随后 n 个块号
//!   日志块 1..=n：对应块号的新内容
//!
//! 上层用 `begin_op`/`end_op` 包裹一次文件系统操作。多个操作可以并发进行，
//! 最后一个结束的操作负责把这一批修改一起提交（组提交）。
//! 日志头写盘是提交真正生效的时刻：此前崩溃，整批修改都不可见；
//! 此后崩溃，挂载时的 `recover` 会把整批修改重放到原位置。

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, info, trace, warn};

use crate::condvar::CondVar;
use crate::consts::fs::LOGSIZE;
use crate::driver::BlockDevice;
use crate::error::{FsError, Result};
use crate::spinlock::SpinLock;

use super::{Bcache, Buf, BufData, SuperBlock};

/// 用于记录和管理文件系统日志的核心结构体。
///
/// `Log` 实现了一个简化的 write-ahead log，以确保多块更新的原子性与崩溃恢复能力。
/// 日志区位置来自超级块，在挂载后不再变化；可变状态（未完成操作数、提交标志、日志头）
/// 由自旋锁保护，长时间的等待通过条件变量完成。
pub struct Log {
    /// 日志区在磁盘中的起始块号（日志头所在块）
    start: u32,
    /// 日志区块数（包括日志头块和数据块）
    size: u32,
    /// 单个操作最多写入的块数，准入控制按此预留空间
    max_op_blocks: usize,
    state: SpinLock<LogState>,
    /// 等待准入或等待提交结束的操作在此挂起
    cv: CondVar,
    /// 仅在 `commit` 内部置位，用于检测并发提交
    in_commit: AtomicBool,
    /// 已提交但写回原位置失败的批次，其中的块保持钉住，只在提交或恢复时访问
    unsettled: SpinLock<LogHeader>,
    commits: AtomicUsize,
    logged_blocks: AtomicUsize,
}

struct LogState {
    /// 当前正在进行的文件系统操作数
    outstanding: usize,
    /// 为 true 时正在提交，新的操作不得进入
    committing: bool,
    /// 当前批次的日志头，记录了修改的块号及数量
    lh: LogHeader,
}

/// 日志统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    /// 已完成的非空提交次数
    pub commits: usize,
    /// 经由日志写回的块总数
    pub logged_blocks: usize,
}

impl Log {
    /// 按超级块描述的日志区创建日志，不做恢复。
    pub fn new(sb: &SuperBlock, max_op_blocks: usize) -> Self {
        let (start, size) = sb.read_log();
        assert!(
            max_op_blocks >= 1 && max_op_blocks < size as usize,
            "log: max_op_blocks {} does not fit a log of {} blocks",
            max_op_blocks,
            size
        );
        Self {
            start,
            size,
            max_op_blocks,
            state: SpinLock::new(
                LogState {
                    outstanding: 0,
                    committing: false,
                    lh: LogHeader::empty(),
                },
                "log",
            ),
            cv: CondVar::new(),
            in_commit: AtomicBool::new(false),
            unsettled: SpinLock::new(LogHeader::empty(), "log unsettled"),
            commits: AtomicUsize::new(0),
            logged_blocks: AtomicUsize::new(0),
        }
    }

    /// 日志头之后可容纳的数据块数
    fn capacity(&self) -> usize {
        self.size as usize - 1
    }

    /// 开始一次文件系统操作。
    ///
    /// # 流程解释
    /// 持有日志锁循环检查：
    /// - 正在提交时等待；
    /// - 若再接纳一个操作会使最坏情况下的日志用量
    ///   （已记录块数 + (outstanding+1) * max_op_blocks）超过容量，等待；
    /// - 否则 `outstanding` 加一并返回该操作的上下文。
    ///
    /// 每个进行中的操作都预留了最坏情况的空间，因此已接纳的操作不会在中途耗尽日志。
    pub fn begin_op(&self) -> OpContext {
        let mut guard = self.state.lock();
        loop {
            if guard.committing
                || guard.lh.len() + (guard.outstanding + 1) * self.max_op_blocks > self.capacity()
            {
                guard = self.cv.wait(guard);
            } else {
                guard.outstanding += 1;
                trace!("log: begin op, outstanding {}", guard.outstanding);
                drop(guard);
                return OpContext::new(self.max_op_blocks);
            }
        }
    }

    /// 把已修改的缓冲块登记到当前批次，实际写盘由提交完成。
    ///
    /// 同一块在日志头中只记录一次；首次记录时钉住该块，保证提交前不会被缓存回收。
    ///
    /// # Panics
    /// - 不在 `begin_op`/`end_op` 之间调用；
    /// - 本操作写入的不同块数超过 `max_op_blocks`；
    /// - 日志头已满。
    /// 以上都说明上层违反了约定。
    pub fn write(&self, ctx: &mut OpContext, buf: &Buf<'_>) {
        let blockno = buf.read_blockno();
        let mut guard = self.state.lock();

        if guard.outstanding < 1 {
            panic!("log: this log write is out of recording");
        }
        if guard.committing {
            panic!("log: write while the log is committing");
        }
        ctx.record(blockno);

        if guard.lh.contains(blockno) {
            return;
        }
        if guard.lh.len() + 1 > self.capacity() {
            panic!("log: not enough space for this transaction");
        }
        buf.pin();
        guard.lh.push(blockno);
        trace!("log: block {} absorbed at slot {}", blockno, guard.lh.len() - 1);
    }

    /// 结束一次文件系统操作。
    ///
    /// # 流程解释
    /// 1. `outstanding` 减一；
    /// 2. 若已无进行中的操作，设置 `committing`，释放日志锁后执行提交，
    ///    提交结束后重新加锁、清除 `committing` 并唤醒全部等待者；
    /// 3. 否则日志预留空间变少了，唤醒一个等待者。
    ///
    /// 调用前必须已释放本操作持有的全部 `Buf`，否则提交时会在块的睡眠锁上自锁。
    ///
    /// # 可能的错误
    /// 提交过程中的设备错误。若日志头尚未落盘，这一批修改被放弃，磁盘保持提交前的状态；
    /// 若已落盘，这一批仍然有效，由下一次提交或 `recover` 从日志区完成写回。
    pub fn end_op(&self, cache: &Bcache, ctx: OpContext) -> Result<()> {
        drop(ctx);
        let mut guard = self.state.lock();
        if guard.outstanding == 0 {
            panic!("log: end_op without begin_op");
        }
        if guard.committing {
            panic!("log: end fs op while the log is committing");
        }
        guard.outstanding -= 1;
        trace!("log: end op, outstanding {}", guard.outstanding);
        if guard.outstanding > 0 {
            self.cv.signal();
            return Ok(());
        }

        guard.committing = true;
        let lh = guard.lh;
        drop(guard);

        // 不持有日志锁执行提交，committing 标志阻止新的操作进入
        let result = self.commit(cache, &lh);

        let mut guard = self.state.lock();
        guard.lh.clear();
        guard.committing = false;
        self.cv.broadcast();
        drop(guard);
        result
    }

    /// 提交日志头 `lh` 中记录的全部块。
    ///
    /// 依次：把缓存中的块写到日志区、写日志头（真正的提交点）、
    /// 把块写回原位置、清空磁盘上的日志头，最后解除钉住。
    fn commit(&self, cache: &Bcache, lh: &LogHeader) -> Result<()> {
        if self.in_commit.swap(true, Ordering::SeqCst) {
            panic!("log: committing while another commit is running");
        }
        let result = self.commit_locked(cache, lh);
        self.in_commit.store(false, Ordering::SeqCst);
        result
    }

    /// # 出错时
    /// - 日志头落盘之前出错：放弃这一批，磁盘保持提交前的状态，
    ///   缓存中被修改过的副本一并作废；
    /// - 日志头落盘之后出错：这一批已经提交，块保持钉住并记为未写回，
    ///   下一次提交（或 `recover`）先从日志区把它们重放到原位置。
    fn commit_locked(&self, cache: &Bcache, lh: &LogHeader) -> Result<()> {
        // 日志区复用之前，上一批已提交的块必须先落到原位置
        if let Err(e) = self.settle(cache) {
            self.abandon(cache, lh);
            return Err(e);
        }
        if lh.len() == 0 {
            return Ok(());
        }
        debug!("log: commit {} blocks", lh.len());
        let logged = self
            .write_log(cache, lh)
            .and_then(|_| self.write_head(cache.device(), lh));
        if let Err(e) = logged {
            self.abandon(cache, lh);
            return Err(e);
        }
        if let Err(e) = self
            .install_trans(cache, lh)
            .and_then(|_| self.empty_head(cache.device()))
        {
            warn!("log: install of {} committed blocks failed: {}", lh.len(), e);
            *self.unsettled.lock() = *lh;
            return Err(e);
        }
        for &blockno in lh.blocknos() {
            cache.unpin_blockno(blockno);
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.logged_blocks.fetch_add(lh.len(), Ordering::Relaxed);
        Ok(())
    }

    /// 放弃未提交的一批：解除钉住，并使缓存副本失效，之后的读取重新从磁盘加载。
    ///
    /// 同时属于未写回批次的块仍被钉住，磁盘原位置还是旧内容，
    /// 改为从日志区重新载入它已提交的内容。
    fn abandon(&self, cache: &Bcache, lh: &LogHeader) {
        let unsettled = *self.unsettled.lock();
        for &blockno in lh.blocknos() {
            cache.unpin_blockno(blockno);
            match unsettled.position(blockno) {
                None => cache.invalidate(blockno),
                Some(slot) => {
                    if let Err(e) = self.reload(cache, slot, blockno) {
                        warn!("log: cannot reload block {} from the log: {}", blockno, e);
                    }
                }
            }
        }
        debug!("log: abandoned {} uncommitted blocks", lh.len());
    }

    fn reload(&self, cache: &Bcache, slot: usize, blockno: u32) -> Result<()> {
        let mut buf = cache.bread(blockno)?;
        cache
            .device()
            .read_block(self.start + 1 + slot as u32, buf.as_block_mut())?;
        Ok(())
    }

    /// 把缓存中被修改的块复制到日志区。
    fn write_log(&self, cache: &Bcache, lh: &LogHeader) -> Result<()> {
        let dev = cache.device();
        for (i, &blockno) in lh.blocknos().iter().enumerate() {
            let buf = cache.bread(blockno)?;
            dev.write_block(self.start + 1 + i as u32, buf.as_block())?;
        }
        Ok(())
    }

    /// 将日志头写入磁盘。
    /// 这是当前批次真正被提交的时间点。
    fn write_head(&self, dev: &dyn BlockDevice, lh: &LogHeader) -> Result<()> {
        let mut data = BufData::new();
        lh.encode(&mut data);
        dev.write_block(self.start, data.as_block())?;
        Ok(())
    }

    /// 清空磁盘上的日志头。此后崩溃不再需要任何恢复动作。
    fn empty_head(&self, dev: &dyn BlockDevice) -> Result<()> {
        self.write_head(dev, &LogHeader::empty())
    }

    /// 把已提交的块从缓存写回原位置。块在整批写回之前保持钉住。
    fn install_trans(&self, cache: &Bcache, lh: &LogHeader) -> Result<()> {
        for &blockno in lh.blocknos() {
            let mut buf = cache.bread(blockno)?;
            buf.bwrite()?;
        }
        Ok(())
    }

    /// 把 `lh` 记录的块从日志区直接复制到原位置，再清空日志头。
    fn install_from_log(&self, dev: &dyn BlockDevice, lh: &LogHeader) -> Result<()> {
        let mut data = BufData::new();
        for (i, &blockno) in lh.blocknos().iter().enumerate() {
            dev.read_block(self.start + 1 + i as u32, data.as_block_mut())?;
            dev.write_block(blockno, data.as_block())?;
        }
        self.empty_head(dev)
    }

    /// 完成上一次写回失败的批次，成功后解除这些块的钉住。
    ///
    /// 这些块的缓存副本一直被钉住，内容不旧于日志区，因此无需作废。
    fn settle(&self, cache: &Bcache) -> Result<()> {
        let unsettled = *self.unsettled.lock();
        if unsettled.len() == 0 {
            return Ok(());
        }
        info!("log: installing {} blocks left by a failed commit", unsettled.len());
        self.install_from_log(cache.device(), &unsettled)?;
        self.release_unsettled(cache);
        Ok(())
    }

    fn release_unsettled(&self, cache: &Bcache) {
        let mut unsettled = self.unsettled.lock();
        for &blockno in unsettled.blocknos() {
            cache.unpin_blockno(blockno);
        }
        unsettled.clear();
    }

    /// 执行日志恢复：把已提交但未写回的日志重放到原位置。
    ///
    /// # 流程解释
    /// 1. 直接从设备读取日志头；
    /// 2. 对日志头中的每个块，从日志区读出并直接写到原位置，
    ///    同时使缓存中该块的旧副本失效；
    /// 3. 清空磁盘与内存中的日志头，解除写回失败批次的钉住。
    ///
    /// 日志头为空时什么也不做，因此可以无条件、重复调用。
    ///
    /// # Panics
    /// 有操作正在进行或正在提交时调用。
    pub fn recover(&self, cache: &Bcache) -> Result<()> {
        let mut guard = self.state.lock();
        if guard.outstanding > 0 || guard.committing {
            panic!("log: recover while file system operations are in flight");
        }
        guard.committing = true;
        drop(guard);

        let result = self.replay(cache);

        let mut guard = self.state.lock();
        guard.lh.clear();
        guard.committing = false;
        self.cv.broadcast();
        drop(guard);
        result
    }

    fn replay(&self, cache: &Bcache) -> Result<()> {
        let dev = cache.device();
        info!("file system: checking logs");
        let lh = self.read_head(dev)?;
        if lh.len() == 0 {
            // 日志头可能已经清空，只是内存里还记着写回失败的批次
            self.release_unsettled(cache);
            info!("file system: no need to recover");
            return Ok(());
        }

        info!("file system: recovering {} blocks from logs", lh.len());
        self.install_from_log(dev, &lh)?;
        let unsettled = *self.unsettled.lock();
        for &blockno in lh.blocknos() {
            if !unsettled.contains(blockno) {
                cache.invalidate(blockno);
            }
        }
        self.release_unsettled(cache);
        Ok(())
    }

    /// 从磁盘中读取日志头。
    fn read_head(&self, dev: &dyn BlockDevice) -> Result<LogHeader> {
        let mut data = BufData::new();
        dev.read_block(self.start, data.as_block_mut())?;
        LogHeader::decode(&data, self.capacity())
    }

    /// 当前批次已记录的块数
    pub fn logged(&self) -> usize {
        self.state.lock().lh.len()
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            commits: self.commits.load(Ordering::Relaxed),
            logged_blocks: self.logged_blocks.load(Ordering::Relaxed),
        }
    }
}

/// 一次文件系统操作的上下文，由 [`Log::begin_op`] 创建，交还给 [`Log::end_op`]。
///
/// 记录本操作写过的不同块，用于检查操作是否超出预留的日志空间。
#[must_use = "an open operation must be closed with end_op"]
pub struct OpContext {
    blocknos: [u32; LOGSIZE - 1],
    len: usize,
    limit: usize,
}

impl OpContext {
    fn new(limit: usize) -> Self {
        Self {
            blocknos: [0; LOGSIZE - 1],
            len: 0,
            limit,
        }
    }

    fn record(&mut self, blockno: u32) {
        if self.contains(blockno) {
            return;
        }
        if self.len == self.limit {
            panic!(
                "log: transaction overflow, more than {} distinct blocks written",
                self.limit
            );
        }
        self.blocknos[self.len] = blockno;
        self.len += 1;
    }

    pub fn contains(&self, blockno: u32) -> bool {
        self.blocknos().contains(&blockno)
    }

    /// 本操作写过的不同块
    pub fn blocknos(&self) -> &[u32] {
        &self.blocknos[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

}

/// 日志头：块数加上按记录顺序排列、互不重复的块号。
#[derive(Clone, Copy)]
struct LogHeader {
    len: u32,

    blocknos: [u32; LOGSIZE - 1],
}

impl LogHeader {
    const fn empty() -> Self {
        Self {
            len: 0,
            blocknos: [0; LOGSIZE - 1],
        }
    }

    fn len(&self) -> usize {
        self.len as usize
    }

    fn blocknos(&self) -> &[u32] {
        &self.blocknos[..self.len()]
    }

    fn contains(&self, blockno: u32) -> bool {
        self.blocknos().contains(&blockno)
    }

    /// `blockno` 所在的日志块序号（从 0 开始）
    fn position(&self, blockno: u32) -> Option<usize> {
        self.blocknos().iter().position(|&b| b == blockno)
    }

    fn push(&mut self, blockno: u32) {
        let len = self.len();
        self.blocknos[len] = blockno;
        self.len += 1;
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn encode(&self, data: &mut BufData) {
        data.zero();
        data.write_u32(0, self.len);
        for (i, &blockno) in self.blocknos().iter().enumerate() {
            data.write_u32(4 + i * 4, blockno);
        }
    }

    fn decode(data: &BufData, capacity: usize) -> Result<Self> {
        let len = data.read_u32(0);
        if len as usize > capacity {
            return Err(FsError::Corrupted("log header longer than log region"));
        }
        let mut lh = Self::empty();
        for i in 0..len as usize {
            lh.push(data.read_u32(4 + i * 4));
        }
        Ok(lh)
    }
}
