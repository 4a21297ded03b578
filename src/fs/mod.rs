//! 文件系统模块
//!
//! [`FileSystem`] 把块缓存、日志、超级块和块设备组合成一个实例，
//! 向上层（inode/文件层）提供块的获取与释放、事务的开始与结束、以及块分配。
//! 设备和超级块由调用者注入，可同时存在多个互不相干的实例。

use std::sync::Arc;

use ::log::info;

use crate::config::FsConfig;
use crate::driver::BlockDevice;
use crate::error::{FsError, Result};

mod bio;
mod block;
mod log;
mod superblock;

pub use self::bio::{Bcache, Buf, BufData};
pub use self::block::{bm_alloc, bm_count_free, bm_free};
pub use self::log::{Log, LogStats, OpContext};
pub use self::superblock::{SuperBlock, DINODE_SIZE, IPB};

pub struct FileSystem {
    dev: Arc<dyn BlockDevice>,
    sb: SuperBlock,
    bcache: Bcache,
    log: Log,
}

impl FileSystem {
    /// 在设备上建立一个空文件系统：超级块、空日志头与初始位图。
    pub fn format(dev: &dyn BlockDevice, sb: &SuperBlock) -> Result<()> {
        if sb.size() > dev.num_blocks() {
            return Err(FsError::InvalidConfig("file system larger than device"));
        }
        let (logstart, _) = sb.read_log();
        dev.write_block(logstart, BufData::new().as_block())?;
        block::bm_format(dev, sb)?;
        // 超级块最后写，写完才算格式化完成
        sb.store(dev)?;
        info!("file system: formatted {} blocks, {} for data", sb.size(), sb.nblocks());
        Ok(())
    }

    /// 挂载设备上的文件系统，并在接纳任何事务之前执行日志恢复。
    pub fn mount<D: BlockDevice + 'static>(dev: D, config: FsConfig) -> Result<Self> {
        Self::mount_shared(Arc::new(dev), config)
    }

    /// 同 [`FileSystem::mount`]，设备以共享指针传入。
    pub fn mount_shared(dev: Arc<dyn BlockDevice>, config: FsConfig) -> Result<Self> {
        let sb = SuperBlock::load(&*dev)?;
        let (_, nlog) = sb.read_log();
        config.validate(nlog)?;

        #[cfg(feature = "verbose_init_info")]
        info!("file system: super block {:?}, config {:?}", sb, config);

        let fs = Self {
            bcache: Bcache::new(Arc::clone(&dev), config.cache_capacity),
            log: Log::new(&sb, config.max_op_blocks),
            dev,
            sb,
        };
        fs.log.recover(&fs.bcache)?;
        info!("file system: setup done");
        Ok(fs)
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    pub fn cache(&self) -> &Bcache {
        &self.bcache
    }

    /// 当前缓存的块数，不超过缓存容量。
    pub fn get_num_cached_blocks(&self) -> usize {
        self.bcache.num_cached()
    }

    /// 获取块 `blockno`：返回时内容有效，调用者独占该块直到释放。
    pub fn bread(&self, blockno: u32) -> Result<Buf<'_>> {
        self.bcache.bread(blockno)
    }

    pub fn brelse(&self, buf: Buf<'_>) {
        self.bcache.brelse(buf)
    }

    pub fn begin_op(&self) -> OpContext {
        self.log.begin_op()
    }

    /// 提交对缓冲块的修改。
    ///
    /// 给出事务上下文时，只把该块登记到事务，由提交负责写盘；
    /// 否则立即同步写回磁盘上的原位置。
    pub fn sync(&self, ctx: Option<&mut OpContext>, buf: &mut Buf<'_>) -> Result<()> {
        match ctx {
            Some(ctx) => {
                self.log.write(ctx, buf);
                Ok(())
            }
            None => buf.bwrite(),
        }
    }

    /// 结束事务。最后一个结束的事务负责提交整批修改。
    ///
    /// 调用前须释放事务中获取的全部 `Buf`。
    pub fn end_op(&self, ctx: OpContext) -> Result<()> {
        self.log.end_op(&self.bcache, ctx)
    }

    pub fn alloc(&self, ctx: &mut OpContext) -> Result<u32> {
        bm_alloc(self, ctx)
    }

    pub fn free(&self, ctx: &mut OpContext, blockno: u32) -> Result<()> {
        bm_free(self, ctx, blockno)
    }

    /// 重放已提交但尚未写回的日志。挂载时已自动执行一次，重复调用无副作用。
    pub fn recover(&self) -> Result<()> {
        self.log.recover(&self.bcache)
    }

    pub fn log_stats(&self) -> LogStats {
        self.log.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::fs::BSIZE;
    use crate::driver::RamDisk;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    const SIZE: u32 = 200;

    fn format(nlog: u32) -> RamDisk {
        let disk = RamDisk::new(SIZE);
        let sb = SuperBlock::layout(SIZE, 32, nlog).unwrap();
        FileSystem::format(&disk, &sb).unwrap();
        disk
    }

    fn fill(fs: &FileSystem, ctx: &mut OpContext, blockno: u32, byte: u8) {
        let mut buf = fs.bread(blockno).unwrap();
        buf.as_bytes_mut().fill(byte);
        fs.sync(Some(ctx), &mut buf).unwrap();
        fs.brelse(buf);
    }

    #[test]
    fn mount_rejects_unformatted_disk() {
        let disk = RamDisk::new(SIZE);
        assert!(matches!(
            FileSystem::mount(disk, FsConfig::default()),
            Err(FsError::BadMagic(_))
        ));
    }

    #[test]
    fn mount_rejects_config_larger_than_log() {
        let disk = format(8);
        let res = FileSystem::mount(disk, FsConfig::default().max_op_blocks(8));
        assert!(matches!(res, Err(FsError::InvalidConfig(_))));
    }

    #[test]
    fn sync_without_transaction_writes_through() {
        let disk = format(10);
        let fs = FileSystem::mount(disk.clone(), FsConfig::default().max_op_blocks(3)).unwrap();
        let b = fs.superblock().data_start();
        let mut buf = fs.bread(b).unwrap();
        buf.as_bytes_mut()[0] = 9;
        fs.sync(None, &mut buf).unwrap();
        fs.brelse(buf);
        assert_eq!(disk.peek(b)[0], 9);
        assert_eq!(fs.cache().pin_count(b), Some(0));
    }

    #[test]
    fn crash_between_commit_and_install_is_repaired_at_mount() {
        let disk = format(10);
        let fs = FileSystem::mount(disk.clone(), FsConfig::default().max_op_blocks(3)).unwrap();
        let base = fs.superblock().data_start();
        let (a, b, c) = (base, base + 5, base + 9);

        let mut ctx = fs.begin_op();
        fill(&fs, &mut ctx, a, 0xa0);
        fill(&fs, &mut ctx, b, 0xb0);
        fill(&fs, &mut ctx, c, 0xc0);
        disk.crash_after(4);
        fs.end_op(ctx).unwrap();
        drop(fs);
        for blockno in [a, b, c] {
            assert_eq!(disk.peek(blockno), [0; BSIZE]);
        }

        disk.reboot();
        let fs = FileSystem::mount(disk.clone(), FsConfig::default().max_op_blocks(3)).unwrap();
        assert_eq!(disk.peek(a), [0xa0; BSIZE]);
        assert_eq!(disk.peek(b), [0xb0; BSIZE]);
        assert_eq!(disk.peek(c), [0xc0; BSIZE]);
        assert_eq!(fs.bread(b).unwrap().as_bytes()[0], 0xb0);

        // 再次恢复不做任何写入
        let writes = disk.write_count();
        fs.recover().unwrap();
        assert_eq!(disk.write_count(), writes);
    }

    #[test]
    fn admission_blocks_until_space_is_freed() {
        let disk = format(8);
        let fs = Arc::new(
            FileSystem::mount(disk.clone(), FsConfig::default().max_op_blocks(4)).unwrap(),
        );
        let base = fs.superblock().data_start();
        let ctx = fs.begin_op();

        let admitted = Arc::new(AtomicBool::new(false));
        let handle = {
            let fs = Arc::clone(&fs);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                let mut ctx = fs.begin_op();
                admitted.store(true, Ordering::SeqCst);
                fill(&fs, &mut ctx, base, 0x42);
                fs.end_op(ctx).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!admitted.load(Ordering::SeqCst));
        fs.end_op(ctx).unwrap();
        handle.join().unwrap();
        assert!(admitted.load(Ordering::SeqCst));
        assert_eq!(disk.peek(base)[0], 0x42);
    }

    #[test]
    fn cache_stays_bounded_under_traffic() {
        let disk = format(10);
        let fs = FileSystem::mount(
            disk,
            FsConfig::default().cache_capacity(6).max_op_blocks(3),
        )
        .unwrap();
        for blockno in 0..SIZE {
            fs.brelse(fs.bread(blockno).unwrap());
            assert!(fs.get_num_cached_blocks() <= 6);
        }
        assert_eq!(fs.get_num_cached_blocks(), 6);
    }

    #[test]
    fn cache_full_is_reported() {
        let disk = format(10);
        let fs = FileSystem::mount(
            disk,
            FsConfig::default().cache_capacity(2).max_op_blocks(3),
        )
        .unwrap();
        let a = fs.bread(40).unwrap();
        let b = fs.bread(41).unwrap();
        assert!(matches!(fs.bread(42), Err(FsError::CacheFull)));
        fs.brelse(a);
        fs.brelse(b);
        assert!(fs.bread(42).is_ok());
    }

    #[test]
    fn concurrent_allocators_get_distinct_blocks() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 10;

        let disk = format(30);
        let fs = Arc::new(FileSystem::mount(disk, FsConfig::default().max_op_blocks(3)).unwrap());
        let free_before = bm_count_free(&fs).unwrap();

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let fs = Arc::clone(&fs);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..PER_THREAD {
                        let mut ctx = fs.begin_op();
                        let b = fs.alloc(&mut ctx).unwrap();
                        fill(&fs, &mut ctx, b, (t * PER_THREAD + i) as u8);
                        fs.end_op(ctx).unwrap();
                        mine.push(b);
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert_eq!(bm_count_free(&fs).unwrap(), free_before - all.len() as u32);
        assert!(fs.log_stats().commits >= 1);
    }
}
