//! 磁盘块分配，基于位图
//!
//! 位图中第 b 位对应块号 b，元数据区对应的位在格式化时即被置位。
//! 分配与释放都借用调用者已经打开的事务，不会自行开启事务。

use bit_field::BitField;
use log::{debug, trace};

use crate::consts::fs::BPB;
use crate::driver::BlockDevice;
use crate::error::{FsError, Result};

use super::{BufData, FileSystem, OpContext, SuperBlock};

/// 位图块上带边界检查的位视图
struct Bitmap<'a> {
    data: &'a mut BufData,
}

impl<'a> Bitmap<'a> {
    fn new(data: &'a mut BufData) -> Self {
        Self { data }
    }

    fn get(&self, bit: u32) -> bool {
        let byte = self.data.as_bytes()[(bit / 8) as usize];
        byte.get_bit((bit % 8) as usize)
    }

    fn set(&mut self, bit: u32, value: bool) {
        let byte = &mut self.data.as_bytes_mut()[(bit / 8) as usize];
        byte.set_bit((bit % 8) as usize, value);
    }

    /// 前 `limit` 位中第一个为 0 的位
    fn first_zero(&self, limit: u32) -> Option<u32> {
        let nbytes = ((limit + 7) / 8) as usize;
        self.data.as_bytes()[..nbytes]
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte != 0xff)
            .flat_map(|(i, byte)| {
                (0..8)
                    .filter(move |bit| !byte.get_bit(*bit))
                    .map(move |bit| (i * 8 + bit) as u32)
            })
            .find(|bit| *bit < limit)
    }
}

/// 分配一个空闲块，并在事务内将其清零。
///
/// # 流程解释
/// 1. 依次通过缓存读取每个位图块，查找第一个为 0 的位；
/// 2. 置位后把位图块登记到事务；
/// 3. 读取对应的数据块，清零后登记到事务；
/// 4. 返回块号。
///
/// # 可能的错误
/// - 位图已满时返回 `FsError::DiskFull`；
/// - 缓存或设备错误原样返回，此时已置位的位图位会被清除。
pub fn bm_alloc(fs: &FileSystem, ctx: &mut OpContext) -> Result<u32> {
    let sb = fs.superblock();
    let total_block = sb.size();
    // 首先，迭代每个位图块
    for base in (0..total_block).step_by(BPB as usize) {
        let mut buf = fs.bread(sb.bitmap_blockno(base))?;
        // 其次，在本块覆盖的范围内查找空闲位
        let limit = (total_block - base).min(BPB);
        let offset = match Bitmap::new(buf.data_mut()).first_zero(limit) {
            Some(offset) => offset,
            None => continue,
        };
        Bitmap::new(buf.data_mut()).set(offset, true);
        fs.sync(Some(&mut *ctx), &mut buf)?;
        drop(buf);

        // 清零空闲块
        let free_bn = base + offset;
        let mut free_buf = match fs.bread(free_bn) {
            Ok(buf) => buf,
            Err(e) => {
                // 位图块已被日志钉住，重新获取不会失败于缓存已满
                let mut buf = fs.bread(sb.bitmap_blockno(base))?;
                Bitmap::new(buf.data_mut()).set(offset, false);
                fs.sync(Some(&mut *ctx), &mut buf)?;
                debug!("bitmap: alloc of block {} rolled back: {}", free_bn, e);
                return Err(e);
            }
        };
        free_buf.zero();
        fs.sync(Some(&mut *ctx), &mut free_buf)?;
        trace!("bitmap: alloc block {}", free_bn);
        return Ok(free_bn);
    }

    debug!("bitmap: cannot alloc any free block");
    Err(FsError::DiskFull)
}

/// 释放块 `blockno`，清除其位图位并登记到事务。
///
/// # Panics
/// 释放元数据块、越界块或未分配的块。
pub fn bm_free(fs: &FileSystem, ctx: &mut OpContext, blockno: u32) -> Result<()> {
    let sb = fs.superblock();
    if blockno < sb.data_start() || blockno >= sb.size() {
        panic!("bitmap: freeing block {} outside the data region", blockno);
    }
    let mut buf = fs.bread(sb.bitmap_blockno(blockno))?;
    let mut bitmap = Bitmap::new(buf.data_mut());
    let offset = blockno % BPB;
    if !bitmap.get(offset) {
        panic!("bitmap: double freeing a block");
    }
    bitmap.set(offset, false);
    fs.sync(Some(ctx), &mut buf)?;
    trace!("bitmap: free block {}", blockno);
    Ok(())
}

/// 格式化时写入初始位图：元数据区的块全部标记为已用，数据区全部空闲。
///
/// 直接写设备，不经过缓存与日志。
pub(super) fn bm_format(dev: &dyn BlockDevice, sb: &SuperBlock) -> Result<()> {
    let used = sb.data_start();
    for i in 0..sb.bitmap_blocks() {
        let base = i * BPB;
        let mut data = BufData::new();
        let mut bitmap = Bitmap::new(&mut data);
        for bit in 0..used.saturating_sub(base).min(BPB) {
            bitmap.set(bit, true);
        }
        dev.write_block(sb.bitmap_blockno(base), data.as_block())?;
    }
    Ok(())
}

/// 统计空闲块数，仅用于诊断。
pub fn bm_count_free(fs: &FileSystem) -> Result<u32> {
    let sb = fs.superblock();
    let mut free = 0;
    for base in (0..sb.size()).step_by(BPB as usize) {
        let mut buf = fs.bread(sb.bitmap_blockno(base))?;
        let bitmap = Bitmap::new(buf.data_mut());
        let limit = (sb.size() - base).min(BPB);
        free += (0..limit).filter(|bit| !bitmap.get(*bit)).count() as u32;
    }
    Ok(free)
}
