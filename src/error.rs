//! 文件系统错误类型
//!
//! 只有资源耗尽与设备错误会以 `FsError` 的形式返回给调用者；
//! 调用方违反约定（事务超额写入、重复释放、引用计数失衡等）直接 panic。

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum FsError {
    /// 底层块设备 I/O 错误
    Io(io::Error),
    /// 没有可回收的缓存槽位（全部被钉住）
    CacheFull,
    /// 位图中没有空闲块
    DiskFull,
    /// 超级块魔数不匹配
    BadMagic(u32),
    /// 超级块内容自相矛盾
    Corrupted(&'static str),
    /// 挂载参数非法
    InvalidConfig(&'static str),
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::Io(e)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "block device I/O error: {}", e),
            Self::CacheFull => write!(f, "no evictable buffer in block cache"),
            Self::DiskFull => write!(f, "no free block on disk"),
            Self::BadMagic(magic) => write!(f, "invalid file system magic {:#x}", magic),
            Self::Corrupted(desc) => write!(f, "file system corrupted: {}", desc),
            Self::InvalidConfig(desc) => write!(f, "invalid configuration: {}", desc),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// 文件系统统一结果类型
pub type Result<T> = std::result::Result<T, FsError>;
