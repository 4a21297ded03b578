//! 块设备驱动模块
//!
//! 文件系统只通过 [`BlockDevice`] 访问磁盘，设备以依赖注入的方式传入，
//! 不存在全局设备实例。

use std::io;

use crate::consts::fs::BSIZE;

mod file_disk;
mod ramdisk;

pub use file_disk::FileDisk;
pub use ramdisk::RamDisk;

/// 一个磁盘块的原始字节
pub type Block = [u8; BSIZE];

/// 以块为单位读写的设备。
pub trait BlockDevice: Send + Sync {
    /// 读取块号为 `blockno` 的整块数据到 `buf`。
    fn read_block(&self, blockno: u32, buf: &mut Block) -> io::Result<()>;
    /// 把 `buf` 整块写入块号 `blockno`。
    fn write_block(&self, blockno: u32, buf: &Block) -> io::Result<()>;
    /// 设备总块数。
    fn num_blocks(&self) -> u32;
}

fn out_of_range(blockno: u32, total: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("block {} out of device range {}", blockno, total),
    )
}
