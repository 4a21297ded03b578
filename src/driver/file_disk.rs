//! 以宿主机文件作为磁盘映像

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use super::{out_of_range, Block, BlockDevice};
use crate::consts::fs::BSIZE;

#[derive(Debug)]
pub struct FileDisk {
    file: Mutex<File>,
    nblocks: u32,
}

impl FileDisk {
    /// 创建（或截断）一个 `nblocks` 块的磁盘映像。
    pub fn create<P: AsRef<Path>>(path: P, nblocks: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(nblocks as u64 * BSIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            nblocks,
        })
    }

    /// 打开已有的磁盘映像，块数由文件长度决定。
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let nblocks = (file.metadata()?.len() / BSIZE as u64) as u32;
        Ok(Self {
            file: Mutex::new(file),
            nblocks,
        })
    }

    fn seek_to(file: &mut File, blockno: u32) -> io::Result<()> {
        file.seek(SeekFrom::Start(blockno as u64 * BSIZE as u64))?;
        Ok(())
    }

    fn poisoned() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "file disk lock poisoned")
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, blockno: u32, buf: &mut Block) -> io::Result<()> {
        if blockno >= self.nblocks {
            return Err(out_of_range(blockno, self.nblocks));
        }
        let mut file = self.file.lock().map_err(|_| Self::poisoned())?;
        Self::seek_to(&mut file, blockno)?;
        file.read_exact(buf)
    }

    fn write_block(&self, blockno: u32, buf: &Block) -> io::Result<()> {
        if blockno >= self.nblocks {
            return Err(out_of_range(blockno, self.nblocks));
        }
        let mut file = self.file.lock().map_err(|_| Self::poisoned())?;
        Self::seek_to(&mut file, blockno)?;
        file.write_all(buf)
    }

    fn num_blocks(&self) -> u32 {
        self.nblocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_survives_reopen() {
        let path = std::env::temp_dir().join(format!("file_disk_{}.img", std::process::id()));
        {
            let disk = FileDisk::create(&path, 8).unwrap();
            assert_eq!(disk.num_blocks(), 8);
            disk.write_block(5, &[0x5a; BSIZE]).unwrap();
        }
        let disk = FileDisk::open(&path).unwrap();
        assert_eq!(disk.num_blocks(), 8);
        let mut buf = [0; BSIZE];
        disk.read_block(5, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; BSIZE]);
        assert!(disk.read_block(8, &mut buf).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
