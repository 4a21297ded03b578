//! 事务性块缓存
//!
//! 一个小型磁盘文件系统的底层：固定容量的块缓存加上 write-ahead log，
//! 向 inode/文件层提供块的获取与释放、事务的开始与结束以及位图块分配，
//! 保证一次事务内的多块更新在崩溃后要么全部可见、要么全部不可见。

#![warn(rust_2018_idioms)]

pub mod condvar;
pub mod config;
pub mod consts;
pub mod driver;
pub mod error;
pub mod fs;
pub mod semaphore;
pub mod sleeplock;
pub mod spinlock;

pub use config::FsConfig;
pub use driver::{BlockDevice, FileDisk, RamDisk};
pub use error::{FsError, Result};
pub use fs::{Buf, FileSystem, OpContext, SuperBlock};
