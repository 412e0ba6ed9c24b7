//! # 磁盘 inode
//!
//! 每个 inode 占 64 字节，内含 10 个块地址：
//!
//! - 0 ~ 5：直接索引，指向数据块
//! - 6 ~ 7：一级间接索引，指向存放 128 个数据块号的索引块
//! - 8 ~ 9：二级间接索引，指向存放 128 个一级索引块号的索引块
//!
//! 块地址为 0 表示尚未分配。

use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};
use enumflags2::bitflags;

use crate::BLOCK_SIZE;
use crate::Result;

/// 索引块的编号容量
pub const INDEX_COUNT: u32 = (BLOCK_SIZE / 4) as u32;
/// inode 中块地址的个数
pub const ADDR_SLOTS: usize = 10;
/// 直接索引的个数
pub const DIRECT_SLOTS: usize = 6;
/// 只用直接索引时可编号的逻辑块数
pub const SMALL_FILE_BLOCK: u32 = DIRECT_SLOTS as u32;
/// 用上一级间接索引时可编号的逻辑块数
pub const LARGE_FILE_BLOCK: u32 = SMALL_FILE_BLOCK + INDEX_COUNT * 2;
/// 用上二级间接索引时可编号的逻辑块数
pub const HUGE_FILE_BLOCK: u32 = LARGE_FILE_BLOCK + INDEX_COUNT * INDEX_COUNT * 2;

/// 文件模式位
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    OtherExec = 0o1,
    OtherWrite = 0o2,
    OtherRead = 0o4,
    GroupExec = 0o10,
    GroupWrite = 0o20,
    GroupRead = 0o40,
    OwnerExec = 0o100,
    OwnerWrite = 0o200,
    OwnerRead = 0o400,
    Sticky = 0o1000,
    SetGid = 0o2000,
    SetUid = 0o4000,
    /// 使用了间接索引
    Large = 0x1000,
    /// 文件类型低位，单独置位为字符设备
    KindLow = 0x2000,
    /// 文件类型高位，单独置位为目录，与低位同时置位为块设备
    KindHigh = 0x4000,
    /// 已分配
    Alloc = 0x8000,
}

/// 磁盘上的 inode
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiskInode {
    /// 模式位，为 0 表示空闲
    pub mode: u32,
    /// 硬链接个数
    pub nlink: u32,
    pub uid: u16,
    pub gid: u16,
    /// 文件字节数
    pub size: u32,
    pub addr: [u32; ADDR_SLOTS],
    pub atime: u32,
    pub mtime: u32,
}

impl DiskInode {
    pub const SIZE: usize = 64;

    pub fn load(bytes: &[u8]) -> Result<Self> {
        Ok(Self::read(&mut Cursor::new(bytes))?)
    }

    pub fn store(&self, bytes: &mut [u8]) -> Result<()> {
        Ok(self.write(&mut Cursor::new(bytes))?)
    }
}

/// 索引块的第 `index` 项
#[inline]
pub fn index_entry(block: &[u8], index: u32) -> u32 {
    let offset = index as usize * 4;
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&block[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// 改写索引块的第 `index` 项
#[inline]
pub fn set_index_entry(block: &mut [u8], index: u32, value: u32) {
    let offset = index as usize * 4;
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
