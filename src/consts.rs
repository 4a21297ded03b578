//! 编译期常量

pub mod fs {
    /// 块大小（字节）
    pub const BSIZE: usize = 1024;

    /// 单个文件系统操作最多写入的块数
    pub const MAXOPBLOCKS: usize = 10;

    /// 日志区最大块数（含日志头）
    pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

    /// 块缓存槽位的最大数量
    pub const NBUF: usize = MAXOPBLOCKS * 3;

    /// 每个位图块所含的位数
    pub const BPB: u32 = (BSIZE * 8) as u32;

    /// 文件系统魔数
    pub const FSMAGIC: u32 = 0x10203040;

    /// 超级块所在块号
    pub const SUPER_BLOCK_NO: u32 = 0;
}
