//! 内存盘
//!
//! 克隆得到的 `RamDisk` 共享同一份磁盘映像，可用来模拟“崩溃后重新挂载”：
//! 调用 [`RamDisk::crash_after`] 后，再写入指定数量的块即进入崩溃状态，
//! 此后的写操作全部被静默丢弃，就像掉电一样。
//! [`RamDisk::fail_write_to`] 则让下一次写某块时返回 I/O 错误，用来检验出错路径。

use std::io;
use std::sync::Arc;

use log::warn;

use super::{out_of_range, Block, BlockDevice};
use crate::consts::fs::BSIZE;
use crate::spinlock::SpinLock;

struct RamDiskInner {
    blocks: Vec<Block>,
    /// 崩溃前还允许落盘的写次数，`None` 表示不注入崩溃
    write_budget: Option<usize>,
    crashed: bool,
    /// 下一次写入该块时返回错误，只生效一次
    faulty: Option<u32>,
    reads: usize,
    writes: usize,
}

#[derive(Clone)]
pub struct RamDisk {
    inner: Arc<SpinLock<RamDiskInner>>,
}

impl RamDisk {
    /// 创建一个 `nblocks` 块、内容全零的内存盘。
    pub fn new(nblocks: u32) -> Self {
        Self {
            inner: Arc::new(SpinLock::new(
                RamDiskInner {
                    blocks: vec![[0; BSIZE]; nblocks as usize],
                    write_budget: None,
                    crashed: false,
                    faulty: None,
                    reads: 0,
                    writes: 0,
                },
                "ramdisk",
            )),
        }
    }

    /// 再成功落盘 `writes` 次后进入崩溃状态。
    pub fn crash_after(&self, writes: usize) {
        let mut inner = self.inner.lock();
        inner.write_budget = Some(writes);
        inner.crashed = writes == 0;
    }

    /// 下一次写块 `blockno` 失败，内容保持不变。
    pub fn fail_write_to(&self, blockno: u32) {
        self.inner.lock().faulty = Some(blockno);
    }

    pub fn is_crashed(&self) -> bool {
        self.inner.lock().crashed
    }

    /// 模拟重启：磁盘内容保持崩溃时的样子，之后的写入重新生效。
    pub fn reboot(&self) {
        let mut inner = self.inner.lock();
        inner.write_budget = None;
        inner.crashed = false;
    }

    /// 绕过文件系统直接查看某块内容。
    pub fn peek(&self, blockno: u32) -> Block {
        self.inner.lock().blocks[blockno as usize]
    }

    /// 绕过文件系统直接改写某块内容。
    pub fn poke(&self, blockno: u32, data: &Block) {
        self.inner.lock().blocks[blockno as usize] = *data;
    }

    /// 累计成功落盘的写次数。
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    pub fn read_count(&self) -> usize {
        self.inner.lock().reads
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, blockno: u32, buf: &mut Block) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let total = inner.blocks.len() as u32;
        let block = inner
            .blocks
            .get(blockno as usize)
            .ok_or_else(|| out_of_range(blockno, total))?;
        buf.copy_from_slice(block);
        inner.reads += 1;
        Ok(())
    }

    fn write_block(&self, blockno: u32, buf: &Block) -> io::Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let total = inner.blocks.len() as u32;
        if blockno >= total {
            return Err(out_of_range(blockno, total));
        }
        if inner.faulty == Some(blockno) {
            inner.faulty = None;
            warn!("ramdisk: injected write fault on block {}", blockno);
            return Err(io::Error::new(io::ErrorKind::Other, "injected write fault"));
        }
        if inner.crashed {
            return Ok(());
        }
        if let Some(budget) = inner.write_budget.as_mut() {
            if *budget == 0 {
                warn!("ramdisk: crashed, dropping write to block {}", blockno);
                inner.crashed = true;
                return Ok(());
            }
            *budget -= 1;
        }
        inner.blocks[blockno as usize] = *buf;
        inner.writes += 1;
        Ok(())
    }

    fn num_blocks(&self) -> u32 {
        self.inner.lock().blocks.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_written_block() {
        let disk = RamDisk::new(4);
        let data = [0xab; BSIZE];
        disk.write_block(2, &data).unwrap();
        let mut buf = [0; BSIZE];
        disk.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(disk.write_count(), 1);
        assert_eq!(disk.read_count(), 1);
    }

    #[test]
    fn out_of_range_is_an_error() {
        let disk = RamDisk::new(4);
        let mut buf = [0; BSIZE];
        let err = disk.read_block(4, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(disk.write_block(9, &buf).is_err());
    }

    #[test]
    fn writes_after_crash_are_dropped() {
        let disk = RamDisk::new(4);
        let shared = disk.clone();
        disk.crash_after(1);
        disk.write_block(0, &[1; BSIZE]).unwrap();
        assert!(!disk.is_crashed());
        disk.write_block(1, &[2; BSIZE]).unwrap();
        assert!(disk.is_crashed());
        assert_eq!(shared.peek(0), [1; BSIZE]);
        assert_eq!(shared.peek(1), [0; BSIZE]);

        shared.reboot();
        disk.fail_write_to(1);
        assert!(disk.write_block(1, &[3; BSIZE]).is_err());
        assert_eq!(shared.peek(1), [0; BSIZE]);
        disk.write_block(1, &[3; BSIZE]).unwrap();
        assert_eq!(shared.peek(1), [3; BSIZE]);
    }
}
