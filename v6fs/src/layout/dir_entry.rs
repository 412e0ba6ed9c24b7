use std::io::Cursor;

use binrw::{BinRead, binrw};

use crate::Result;

/// 文件名的最大长度
pub const NAME_MAX_LEN: usize = 28;

/// 目录项：inode 编号加定长文件名，不足部分补零
///
/// inode 编号为 0 的目录项是空位，可被重新使用。
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u32,
    name: [u8; NAME_MAX_LEN],
}

impl DirEntry {
    /// 目录项大小恒为32字节
    pub const SIZE: usize = 32;

    /// 名字过长时返回 `None`
    pub fn new(name: &[u8], ino: u32) -> Option<Self> {
        if name.len() > NAME_MAX_LEN {
            return None;
        }
        let mut field = [0; NAME_MAX_LEN];
        field[..name.len()].copy_from_slice(name);
        Some(Self { ino, name: field })
    }

    /// 空位
    pub fn vacant() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(NAME_MAX_LEN);
        &self.name[..len]
    }

    pub fn is_vacant(&self) -> bool {
        self.ino == 0
    }

    /// 是否是 "." 或 ".."
    pub fn is_dot(&self) -> bool {
        matches!(self.name(), b"." | b"..")
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        Ok(Self::read(&mut Cursor::new(bytes))?)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[..4].copy_from_slice(&self.ino.to_le_bytes());
        bytes[4..].copy_from_slice(&self.name);
        bytes
    }
}
