use std::io;

use derive_more::Display;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Display)]
pub enum Error {
    /// 块设备读写未完成
    #[display(fmt = "device I/O failure: {}", _0)]
    Io(io::Error),
    /// 空闲盘块或空闲 inode 耗尽
    #[display(fmt = "no space left on volume")]
    NoSpace,
    /// 磁盘结构损坏，操作立即中止
    #[display(fmt = "corrupted volume: {}", _0)]
    Corrupted(Corruption),
    /// 逻辑块号超出混合索引树的寻址范围
    #[display(fmt = "logical block {} beyond addressable range", _0)]
    BlockOutOfRange(u32),
    /// 从空闲栈弹出的 inode 已经存活于内存中
    #[display(fmt = "inode {} popped from free stack is already live", _0)]
    Race(u32),
    #[display(fmt = "no such directory entry")]
    NotFound,
    #[display(fmt = "directory entry already exists")]
    AlreadyExists,
    #[display(fmt = "name longer than 28 bytes")]
    NameTooLong,
    /// 空名、含 '/' 或 NUL 的名字，以及对 "." 与 ".." 的增删
    #[display(fmt = "invalid directory entry name")]
    InvalidName,
    #[display(fmt = "not a directory")]
    NotADirectory,
    #[display(fmt = "directory not empty")]
    DirectoryNotEmpty,
    #[display(fmt = "volume is read-only")]
    ReadOnly,
    /// 块缓存容量不足以支撑卷上的操作
    #[display(fmt = "block cache of {} slots, at least 3 needed", _0)]
    CacheTooSmall(usize),
}

/// 结构损坏的具体原因
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    #[display(fmt = "free-block stack height {} out of [0, 100]", _0)]
    FreeStackHeight(u32),
    #[display(fmt = "free-inode stack height {} out of [0, 100]", _0)]
    InodeStackHeight(u32),
    #[display(fmt = "block {} outside the data area", _0)]
    BadBlock(u32),
    #[display(fmt = "block {} appears twice in the free-block chain", _0)]
    FreeBlockTwice(u32),
    #[display(fmt = "inode {} outside the inode area", _0)]
    BadInode(u32),
    #[display(fmt = "inode area of {} blocks on a volume of {} blocks", inode_blocks, total_blocks)]
    Geometry { inode_blocks: u32, total_blocks: u32 },
    #[display(fmt = "undecodable on-disk record")]
    Record,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<Corruption> for Error {
    fn from(kind: Corruption) -> Self {
        log::error!("{kind}");
        Self::Corrupted(kind)
    }
}

impl From<binrw::Error> for Error {
    fn from(err: binrw::Error) -> Self {
        log::error!("{err}");
        Self::Corrupted(Corruption::Record)
    }
}
