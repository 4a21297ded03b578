//! 挂载参数
//!
//! 编译期上限见 [`crate::consts::fs`]；这里是每个文件系统实例可单独调整的部分，
//! 在挂载时结合超级块校验。

use crate::consts::fs::{MAXOPBLOCKS, NBUF};
use crate::error::{FsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    /// 块缓存最多启用的槽位数，`1..=NBUF`
    pub cache_capacity: usize,
    /// 单个操作最多写入的不同块数，必须小于日志区块数
    pub max_op_blocks: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: NBUF,
            max_op_blocks: MAXOPBLOCKS,
        }
    }
}

impl FsConfig {
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn max_op_blocks(mut self, blocks: usize) -> Self {
        self.max_op_blocks = blocks;
        self
    }

    /// 结合日志区块数 `nlog`（含日志头）检查参数。
    pub fn validate(&self, nlog: u32) -> Result<()> {
        if self.cache_capacity == 0 || self.cache_capacity > NBUF {
            return Err(FsError::InvalidConfig("cache capacity must be within 1..=NBUF"));
        }
        if self.max_op_blocks == 0 || self.max_op_blocks >= nlog as usize {
            return Err(FsError::InvalidConfig("max_op_blocks must fit in the log region"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fits_full_log() {
        assert!(FsConfig::default().validate(30).is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(FsConfig::default().cache_capacity(0).validate(30).is_err());
        assert!(FsConfig::default().cache_capacity(NBUF + 1).validate(30).is_err());
        assert!(FsConfig::default().max_op_blocks(0).validate(30).is_err());
        assert!(FsConfig::default().max_op_blocks(8).validate(8).is_err());
        assert!(FsConfig::default().max_op_blocks(7).validate(8).is_ok());
    }
}
