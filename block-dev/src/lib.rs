//! # 块设备接口层
//!
//! 块设备是以**块**为单位存储数据的设备，例如磁盘、光盘、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 所有读写都是同步的：调用返回时 I/O 已经完成或已经失败。

mod ram;

pub use ram::RamDisk;

use std::any::Any;
use std::io;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    /// 把第 `block_id` 块读入 `buf`，`buf` 的长度即块大小
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> io::Result<()>;

    /// 把 `buf` 写入第 `block_id` 块
    fn write_block(&self, block_id: usize, buf: &[u8]) -> io::Result<()>;
}
