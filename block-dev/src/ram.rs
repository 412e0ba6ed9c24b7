use std::collections::BTreeSet;
use std::io;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::BlockDevice;

/// 内存盘：以一段连续内存模拟块设备
///
/// 记录读写次数，并可把指定的块标记为坏块，用于测试 I/O 失败路径。
pub struct RamDisk {
    block_size: usize,
    data: Mutex<Vec<u8>>,
    faulty: Mutex<BTreeSet<usize>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(block_size: usize, blocks: usize) -> Self {
        Self {
            block_size,
            data: Mutex::new(vec![0; block_size * blocks]),
            faulty: Mutex::new(BTreeSet::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn blocks(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len() / self.block_size
    }

    /// 设备读次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 设备写次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 标记或取消坏块，坏块的读写均返回错误
    pub fn set_faulty(&self, block_id: usize, faulty: bool) {
        let mut set = self.faulty.lock().unwrap_or_else(PoisonError::into_inner);
        if faulty {
            set.insert(block_id);
        } else {
            set.remove(&block_id);
        }
    }

    /// 绕过计数直接查看某块的内容
    pub fn snapshot(&self, block_id: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = block_id * self.block_size;
        data[start..start + self.block_size].to_vec()
    }

    fn range(&self, block_id: usize, len: usize) -> io::Result<std::ops::Range<usize>> {
        if len != self.block_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer of {len} bytes is not a complete block"),
            ));
        }
        if self
            .faulty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&block_id)
        {
            return Err(io::Error::other(format!("bad block {block_id}")));
        }
        let start = block_id * self.block_size;
        Ok(start..start + len)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        let range = self.range(block_id, buf.len())?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let src = data.get(range).ok_or(io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        let range = self.range(block_id, buf.len())?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let dst = data.get_mut(range).ok_or(io::ErrorKind::UnexpectedEof)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_written_block() {
        let disk = RamDisk::new(512, 4);
        let block = [0x5a; 512];
        disk.write_block(2, &block).unwrap();

        let mut buf = [0; 512];
        disk.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, block);
        assert_eq!((disk.reads(), disk.writes()), (1, 1));
    }

    #[test]
    fn faulty_and_out_of_range_blocks_fail() {
        let disk = RamDisk::new(512, 4);
        let mut buf = [0; 512];
        assert!(disk.read_block(4, &mut buf).is_err());

        disk.set_faulty(1, true);
        assert!(disk.write_block(1, &buf).is_err());
        disk.set_faulty(1, false);
        assert!(disk.write_block(1, &buf).is_ok());
    }
}
