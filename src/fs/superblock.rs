//! 超级块操作
//!
//! 磁盘布局（块 0 为超级块）：
//! `[ 超级块 ][ 日志头 + 日志数据 ][ inode 区 ][ 位图区 ][ 数据区 ]`
//!
//! 超级块在挂载时读取一次，此后只读，由缓存、日志和分配器共享。

use core::fmt;

use crate::consts::fs::{BPB, BSIZE, FSMAGIC, LOGSIZE, SUPER_BLOCK_NO};
use crate::driver::BlockDevice;
use crate::error::{FsError, Result};

use super::BufData;

/// 每个磁盘 inode 占用的字节数（inode 的具体布局由上层决定）
pub const DINODE_SIZE: usize = 64;
/// 每块 inode 数
pub const IPB: u32 = (BSIZE / DINODE_SIZE) as u32;

/// 超级块在磁盘上的字段顺序，每个字段为小端 u32。
const FIELDS: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    magic: u32,      // 文件系统魔数，必须为`FSMAGIC`
    size: u32,       // 文件系统映像总块数
    nblocks: u32,    // 数据块数量（不含元数据）
    ninodes: u32,    // 索引节点总数
    nlog: u32,       // 日志块数量（含日志头）
    logstart: u32,   // 第一个日志块的块号
    inodestart: u32, // 第一个索引节点块的块号
    bmapstart: u32,  // 第一个位图块的块号
}

impl SuperBlock {
    /// 为一块 `size` 块的磁盘计算布局。
    ///
    /// # 参数
    /// - `size`: 磁盘总块数；
    /// - `ninodes`: inode 数量，决定 inode 区大小；
    /// - `nlog`: 日志区块数（含日志头），不得超过 `LOGSIZE`。
    ///
    /// # 可能的错误
    /// 日志区过小或过大、元数据区挤占掉全部空间时返回 `FsError::InvalidConfig`。
    pub fn layout(size: u32, ninodes: u32, nlog: u32) -> Result<Self> {
        if nlog < 2 {
            return Err(FsError::InvalidConfig("log region needs a header and one data block"));
        }
        if nlog as usize > LOGSIZE {
            return Err(FsError::InvalidConfig("log region larger than LOGSIZE"));
        }
        let ninodeblocks = ninodes / IPB + 1;
        let nbitmap = size / BPB + 1;
        let logstart = SUPER_BLOCK_NO + 1;
        let inodestart = logstart + nlog;
        let bmapstart = inodestart + ninodeblocks;
        let nmeta = bmapstart + nbitmap;
        if nmeta >= size {
            return Err(FsError::InvalidConfig("no room left for data blocks"));
        }
        Ok(Self {
            magic: FSMAGIC,
            size,
            nblocks: size - nmeta,
            ninodes,
            nlog,
            logstart,
            inodestart,
            bmapstart,
        })
    }

    /// 从块设备读取并校验超级块。
    ///
    /// 挂载时缓存尚未建立，因此直接走原始设备。
    pub fn load(dev: &dyn BlockDevice) -> Result<Self> {
        let mut data = BufData::new();
        dev.read_block(SUPER_BLOCK_NO, data.as_block_mut())?;
        let sb = Self::decode(&data);
        sb.validate(dev.num_blocks())?;
        Ok(sb)
    }

    /// 把超级块写到块设备。
    pub fn store(&self, dev: &dyn BlockDevice) -> Result<()> {
        let mut data = BufData::new();
        self.encode(&mut data);
        dev.write_block(SUPER_BLOCK_NO, data.as_block())?;
        Ok(())
    }

    fn decode(data: &BufData) -> Self {
        let f = |i: usize| data.read_u32(i * 4);
        Self {
            magic: f(0),
            size: f(1),
            nblocks: f(2),
            ninodes: f(3),
            nlog: f(4),
            logstart: f(5),
            inodestart: f(6),
            bmapstart: f(7),
        }
    }

    fn encode(&self, data: &mut BufData) {
        let fields: [u32; FIELDS] = [
            self.magic,
            self.size,
            self.nblocks,
            self.ninodes,
            self.nlog,
            self.logstart,
            self.inodestart,
            self.bmapstart,
        ];
        for (i, v) in fields.iter().enumerate() {
            data.write_u32(i * 4, *v);
        }
    }

    fn validate(&self, dev_blocks: u32) -> Result<()> {
        if self.magic != FSMAGIC {
            return Err(FsError::BadMagic(self.magic));
        }
        if self.size > dev_blocks {
            return Err(FsError::Corrupted("file system larger than device"));
        }
        if self.logstart <= SUPER_BLOCK_NO || self.nlog < 2 || self.nlog as usize > LOGSIZE {
            return Err(FsError::Corrupted("bad log region"));
        }
        // 字段来自磁盘，加法可能溢出
        let log_end = self
            .logstart
            .checked_add(self.nlog)
            .ok_or(FsError::Corrupted("bad log region"))?;
        if self.inodestart < log_end || self.bmapstart < self.inodestart {
            return Err(FsError::Corrupted("overlapping regions"));
        }
        let data_start = self
            .bmapstart
            .checked_add(self.bitmap_blocks())
            .ok_or(FsError::Corrupted("bad data region"))?;
        if data_start > self.size || self.size - data_start != self.nblocks {
            return Err(FsError::Corrupted("bad data region"));
        }
        Ok(())
    }

    /// 日志区的起始块号与块数（含日志头）
    pub fn read_log(&self) -> (u32, u32) {
        (self.logstart, self.nlog)
    }

    /// 包含块 `blockno` 分配位的位图块号
    pub fn bitmap_blockno(&self, blockno: u32) -> u32 {
        (blockno / BPB) + self.bmapstart
    }

    pub fn bitmap_blocks(&self) -> u32 {
        self.size / BPB + 1
    }

    /// 第一个数据块的块号，此前的块全部属于元数据
    pub fn data_start(&self) -> u32 {
        self.bmapstart + self.bitmap_blocks()
    }

    pub fn inode_start(&self) -> u32 {
        self.inodestart
    }

    pub fn nblocks(&self) -> u32 {
        self.nblocks
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

impl fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperBlock")
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("size", &self.size)
            .field("nblocks", &self.nblocks)
            .field("ninodes", &self.ninodes)
            .field("nlog", &self.nlog)
            .field("logstart", &self.logstart)
            .field("inodestart", &self.inodestart)
            .field("bmapstart", &self.bmapstart)
            .finish()
    }
}
