
use std::fs::File;
use std::io;
use std::io::{Read, Write};
use std::io::{Seek, SeekFrom};
use std::sync::Mutex;
use std::sync::PoisonError;

use v6fs::BLOCK_SIZE;
use v6fs::BlockDevice;

/// 以宿主机上的普通文件作为块设备
pub struct BlockFile(pub Mutex<File>);

impl BlockFile {
    /// 把文件内偏移移到第 `block_id` 块
    fn seek(file: &mut File, block_id: usize, len: usize) -> io::Result<()> {
        if len != BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a complete block!",
            ));
        }
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))?;
        Ok(())
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Self::seek(&mut file, block_id, buf.len())?;
        file.read_exact(buf)
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()> {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Self::seek(&mut file, block_id, buf.len())?;
        file.write_all(buf)
    }
}
