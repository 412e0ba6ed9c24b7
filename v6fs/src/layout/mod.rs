//! # 磁盘数据结构层
//!
//! v6fs 的磁盘布局（以 512 字节扇区计）：
//! 保留区 | 超级块（200、201） | inode 区（202 起） | 数据区（1024 起）
//!
//! 所有多字节字段均以小端序存储，与主机字节序无关。

mod super_block;
pub use super_block::{FreeGroup, SuperBlock};

mod inode;
pub use inode::{DiskInode, Mode};
pub use inode::{ADDR_SLOTS, DIRECT_SLOTS, INDEX_COUNT};
pub use inode::{HUGE_FILE_BLOCK, LARGE_FILE_BLOCK, SMALL_FILE_BLOCK};
pub use inode::{index_entry, set_index_entry};

/// 目录项，也属于磁盘文件系统数据结构
mod dir_entry;
pub use dir_entry::{DirEntry, NAME_MAX_LEN};

/// 超级块起始扇区
pub const SUPER_BLOCK_SECTOR: u32 = 200;
/// 超级块占据的扇区数
pub const SUPER_BLOCK_SECTORS: u32 = 2;
/// inode 区起始扇区
pub const INODE_ZONE_START: u32 = SUPER_BLOCK_SECTOR + SUPER_BLOCK_SECTORS;
/// 数据区起始扇区
pub const DATA_ZONE_START: u32 = 1024;
/// 格式化时 inode 区占据的扇区数
pub const INODE_ZONE_BLOCKS: u32 = DATA_ZONE_START - INODE_ZONE_START;
/// 每个扇区容纳的 inode 数
pub const INODES_PER_BLOCK: u32 = (crate::BLOCK_SIZE / DiskInode::SIZE) as u32;
/// 根目录的 inode 编号
pub const ROOT_INO: u32 = 0;
/// 空闲栈的容量
pub const FAST_STACK_CAP: usize = 100;
/// 超级块中表示目录内含 "." 与 ".." 的取值
pub const HAS_DOTS: u32 = 0xFFFF_FFFF;
