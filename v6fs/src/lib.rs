/* v6fs 的整体架构，自上而下 */

// 目录层：在目录文件中检索、创建、删除目录项
mod dir;
pub use dir::{DirEntryInfo, Located, Search};

// 索引节点层：地址映射、文件读写、截断与回写
mod inode;
pub use inode::{FileKind, Inode, Stat};

// 卷管理层：超级块、空闲盘块与空闲 inode 的分配
mod volume;
pub use volume::{DotLayout, FormatOptions, MIN_CACHE_SLOTS, Volume};

// 磁盘数据结构层：表示磁盘文件系统的数据结构
pub mod layout;

// 块缓存层：内存上的磁盘块数据缓存
pub mod block_cache;
pub use block_cache::{BlockCache, Buf, CacheConfig, DeviceId, SlotState};

mod error;
pub use error::{Corruption, Error, Result};

mod sync;

pub use block_dev::BlockDevice;

pub const BLOCK_SIZE: usize = 512;

type DataBlock = [u8; BLOCK_SIZE];
