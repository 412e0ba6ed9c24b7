use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};

use super::FAST_STACK_CAP;
use crate::Result;

/// 空闲栈：一个计数加上至多 100 个盘块号或 inode 编号
///
/// 超级块中的两个空闲栈与磁盘上溢出的空闲盘块组都采用这一布局。
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeGroup {
    /// 栈高
    pub count: u32,
    pub entries: [u32; FAST_STACK_CAP],
}

impl FreeGroup {
    /// 磁盘上占据的字节数
    pub const SIZE: usize = 4 + 4 * FAST_STACK_CAP;

    pub fn empty() -> Self {
        Self {
            count: 0,
            entries: [0; FAST_STACK_CAP],
        }
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        Ok(Self::read(&mut Cursor::new(bytes))?)
    }

    pub fn store(&self, bytes: &mut [u8]) -> Result<()> {
        Ok(self.write(&mut Cursor::new(bytes))?)
    }

    /// 栈高是否在 [0, 100] 内
    pub fn is_valid(&self) -> bool {
        self.count as usize <= FAST_STACK_CAP
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= FAST_STACK_CAP
    }

    /// 栈中现有的元素，自栈底到栈顶
    pub fn as_slice(&self) -> &[u32] {
        &self.entries[..self.len().min(FAST_STACK_CAP)]
    }

    pub fn contains(&self, value: u32) -> bool {
        self.as_slice().contains(&value)
    }

    pub fn top(&self) -> Option<u32> {
        self.as_slice().last().copied()
    }

    /// 栈满时返回 `false`
    pub fn push(&mut self, value: u32) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries[self.len()] = value;
        self.count += 1;
        true
    }

    pub fn pop(&mut self) -> Option<u32> {
        let value = self.top()?;
        self.count -= 1;
        Some(value)
    }
}

/// 超级块：卷的尺寸、空闲盘块栈、空闲 inode 栈与若干标志
///
/// 占据两个扇区，有效内容 836 字节，其余补零。
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    /// inode 区占据的盘块数
    pub inode_blocks: u32,
    /// 卷的总盘块数
    pub total_blocks: u32,
    pub free_blocks: FreeGroup,
    pub free_inodes: FreeGroup,
    /// 为 0xFFFFFFFF 时目录内含 "." 与 ".."
    pub has_dots: u32,
    reserved: u32,
    /// 内存中的超级块是否被修改过
    pub modified: u32,
    pub read_only: u32,
    /// 最近一次写回的时间（秒）
    pub time: u32,
}

impl SuperBlock {
    /// 两个扇区的总字节数
    pub const SIZE: usize = 2 * crate::BLOCK_SIZE;

    pub fn new(inode_blocks: u32, total_blocks: u32, has_dots: u32) -> Self {
        Self {
            inode_blocks,
            total_blocks,
            free_blocks: FreeGroup::empty(),
            free_inodes: FreeGroup::empty(),
            has_dots,
            reserved: 0,
            modified: 0,
            read_only: 0,
            time: 0,
        }
    }

    pub fn load(bytes: &[u8]) -> Result<Self> {
        Ok(Self::read(&mut Cursor::new(bytes))?)
    }

    /// 编码到 `bytes` 开头，其余字节不动
    pub fn store(&self, bytes: &mut [u8]) -> Result<()> {
        Ok(self.write(&mut Cursor::new(bytes))?)
    }
}
