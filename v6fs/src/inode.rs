//! # 索引节点层
//!
//! 内存 inode 是磁盘 inode 的副本，加上最近读过的逻辑块号与修改标记。
//! 同一 inode 编号在内存中至多一个实例，由 [`Volume::iget`] 取得，
//! 最后一个引用消失时写回；若链接数已降为 0，还会释放其全部盘块与编号。
//!
//! ## 地址映射
//!
//! 逻辑块号依次落在直接索引、一级间接索引与二级间接索引的范围内，
//! 超出 [`HUGE_FILE_BLOCK`] 即越界。写路径遇到空洞时分配新盘块，
//! 新分配的数据块与索引块一律清零后延迟写；读路径遇到空洞时读出全零，不分配。

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use enumflags2::{BitFlags, bitflags};

use crate::layout::{ADDR_SLOTS, DIRECT_SLOTS, INDEX_COUNT};
use crate::layout::{DiskInode, Mode, index_entry, set_index_entry};
use crate::layout::{HUGE_FILE_BLOCK, LARGE_FILE_BLOCK, SMALL_FILE_BLOCK};
use crate::sync::lock;
use crate::volume::{Volume, now};
use crate::{BLOCK_SIZE, Error, Result};

/// 文件类型，由模式位的类型字段决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        let mode = BitFlags::<Mode>::from_bits_truncate(mode);
        match (mode.contains(Mode::KindHigh), mode.contains(Mode::KindLow)) {
            (false, false) => Self::Regular,
            (true, false) => Self::Directory,
            (false, true) => Self::CharDevice,
            (true, true) => Self::BlockDevice,
        }
    }

    pub fn flags(self) -> BitFlags<Mode> {
        match self {
            Self::Regular => BitFlags::empty(),
            Self::Directory => Mode::KindHigh.into(),
            Self::CharDevice => Mode::KindLow.into(),
            Self::BlockDevice => Mode::KindHigh | Mode::KindLow,
        }
    }
}

/// 内存 inode 的修改标记
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InodeFlag {
    /// 内容或属性被修改过
    Update = 0b01,
    /// 被访问过
    Access = 0b10,
}

/// 文件的元信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub kind: FileKind,
    pub mode: BitFlags<Mode>,
    pub nlink: u32,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
}

/// 内存 inode
pub struct Inode {
    ino: u32,
    volume: Arc<Volume>,
    inner: Mutex<InodeInner>,
}

pub(crate) struct InodeInner {
    pub(crate) disk: DiskInode,
    /// 最近一次读过的逻辑块号
    last_read: Option<u32>,
    flags: BitFlags<InodeFlag>,
}

impl Inode {
    pub(crate) fn new(volume: Arc<Volume>, ino: u32, disk: DiskInode) -> Self {
        Self {
            ino,
            volume,
            inner: Mutex::new(InodeInner {
                disk,
                last_read: None,
                flags: BitFlags::empty(),
            }),
        }
    }

    #[inline]
    pub fn number(&self) -> u32 {
        self.ino
    }

    #[inline]
    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, InodeInner> {
        lock(&self.inner)
    }

    pub fn stat(&self) -> Stat {
        let inner = self.lock();
        let disk = &inner.disk;
        Stat {
            ino: self.ino,
            kind: FileKind::from_mode(disk.mode),
            mode: BitFlags::from_bits_truncate(disk.mode),
            nlink: disk.nlink,
            uid: disk.uid,
            gid: disk.gid,
            size: disk.size,
            atime: disk.atime,
            mtime: disk.mtime,
        }
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.lock().disk.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub fn size(&self) -> u32 {
        self.lock().disk.size
    }

    pub fn nlink(&self) -> u32 {
        self.lock().disk.nlink
    }

    /// 模式位非 0 即已分配
    pub fn is_allocated(&self) -> bool {
        self.lock().disk.mode != 0
    }

    pub fn last_read(&self) -> Option<u32> {
        self.lock().last_read
    }

    /// 块地址表的副本
    pub fn addr(&self) -> [u32; ADDR_SLOTS] {
        self.lock().disk.addr
    }

    /// 初始化新分配的 inode，链接数为 1
    pub fn init(&self, kind: FileKind, perm: BitFlags<Mode>) {
        let mut inner = self.lock();
        let perm = perm & BitFlags::from_bits_truncate(0o7777);
        inner.disk.mode = (perm | kind.flags() | Mode::Alloc).bits();
        inner.disk.nlink = 1;
        inner.flags |= InodeFlag::Update | InodeFlag::Access;
    }

    pub fn set_nlink(&self, nlink: u32) {
        let mut inner = self.lock();
        inner.disk.nlink = nlink;
        inner.flags |= InodeFlag::Update;
    }

    pub fn set_owner(&self, uid: u16, gid: u16) {
        let mut inner = self.lock();
        inner.disk.uid = uid;
        inner.disk.gid = gid;
        inner.flags |= InodeFlag::Update;
    }

    /// 清空刚从空闲栈中取出的 inode
    pub(crate) fn reset(&self) {
        let mut inner = self.lock();
        inner.disk = DiskInode::default();
        inner.last_read = None;
        inner.flags = BitFlags::empty();
    }

    /// 把逻辑块号映射为物理块号，必要时分配数据块与索引块
    pub fn bmap(&self, lbn: u32) -> Result<u32> {
        self.lock().bmap(&self.volume, lbn)
    }

    /// 从 `offset` 处读至多 `buf.len()` 字节，返回读到的字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.lock().read_at(&self.volume, offset, buf)
    }

    /// 在 `offset` 处写入 `buf`，文件随之增长
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        self.lock().write_at(&self.volume, offset, buf)
    }

    /// 释放全部数据块与索引块，文件长度归零
    pub fn truncate(&self) -> Result<()> {
        if self.volume.is_read_only() {
            return Err(Error::ReadOnly);
        }
        self.lock().truncate(&self.volume)
    }

    /// 写回磁盘 inode
    pub fn sync(&self) -> Result<()> {
        self.lock().update(&self.volume, self.ino)
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .finish_non_exhaustive()
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let ino = self.ino;
        let volume = &self.volume;
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        volume.retire(ino, || {
            if let Err(err) = inner.release(volume, ino) {
                log::error!("inode {ino}: release failed: {err}");
            }
        });
    }
}

impl InodeInner {
    /// 逻辑块号映射为物理块号，`allocate` 为假时遇到空洞返回 `None`
    pub(crate) fn map(&mut self, volume: &Volume, lbn: u32, allocate: bool) -> Result<Option<u32>> {
        if lbn >= HUGE_FILE_BLOCK {
            log::error!("logical block {lbn} beyond addressable range");
            return Err(Error::BlockOutOfRange(lbn));
        }

        // 块地址表下标，以及逐级索引块内的下标
        let (slot, path, depth) = if lbn < SMALL_FILE_BLOCK {
            (lbn as usize, [0; 2], 0)
        } else if lbn < LARGE_FILE_BLOCK {
            let rest = lbn - SMALL_FILE_BLOCK;
            (
                DIRECT_SLOTS + (rest / INDEX_COUNT) as usize,
                [rest % INDEX_COUNT, 0],
                1,
            )
        } else {
            let rest = lbn - LARGE_FILE_BLOCK;
            (
                DIRECT_SLOTS + 2 + (rest / (INDEX_COUNT * INDEX_COUNT)) as usize,
                [(rest / INDEX_COUNT) % INDEX_COUNT, rest % INDEX_COUNT],
                2,
            )
        };

        let mut block = self.disk.addr[slot];
        if block == 0 {
            if !allocate {
                return Ok(None);
            }
            block = alloc_zeroed(volume)?;
            self.disk.addr[slot] = block;
            if depth > 0 {
                self.disk.mode |= Mode::Large as u32;
            }
            self.flags |= InodeFlag::Update;
        }

        for &entry in &path[..depth] {
            match resolve(volume, block, entry, allocate)? {
                Some(child) => block = child,
                None => return Ok(None),
            }
        }
        Ok(Some(block))
    }

    pub(crate) fn bmap(&mut self, volume: &Volume, lbn: u32) -> Result<u32> {
        self.map(volume, lbn, true)?.ok_or(Error::NoSpace)
    }

    pub(crate) fn read_at(&mut self, volume: &Volume, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let size = self.disk.size as usize;
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let end = size.min(offset.saturating_add(buf.len()));

        let mut pos = offset;
        while pos < end {
            let lbn = (pos / BLOCK_SIZE) as u32;
            let start = pos % BLOCK_SIZE;
            let len = (BLOCK_SIZE - start).min(end - pos);
            let dst = &mut buf[pos - offset..pos - offset + len];
            match self.map(volume, lbn, false)? {
                Some(block) => dst.copy_from_slice(&volume.read_block(block)?[start..start + len]),
                None => dst.fill(0),
            }
            self.last_read = Some(lbn);
            pos += len;
        }

        self.flags |= InodeFlag::Access;
        Ok(end - offset)
    }

    pub(crate) fn write_at(&mut self, volume: &Volume, offset: usize, data: &[u8]) -> Result<usize> {
        if volume.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let Some(end) = offset.checked_add(data.len()) else {
            return Err(Error::BlockOutOfRange(u32::MAX));
        };
        let last = (end - 1) / BLOCK_SIZE;
        if last >= HUGE_FILE_BLOCK as usize {
            return Err(Error::BlockOutOfRange(u32::try_from(last).unwrap_or(u32::MAX)));
        }

        self.flags |= InodeFlag::Access | InodeFlag::Update;
        let cache = volume.cache();
        let dev = volume.device();
        let mut pos = offset;
        while pos < end {
            let lbn = (pos / BLOCK_SIZE) as u32;
            let start = pos % BLOCK_SIZE;
            let len = (BLOCK_SIZE - start).min(end - pos);
            let block = self.bmap(volume, lbn)?;

            // 整块覆盖时不必先读入
            let mut buf = if len == BLOCK_SIZE {
                cache.get_block(dev, block)
            } else {
                cache.read_block(dev, block)?
            };
            buf[start..start + len].copy_from_slice(&data[pos - offset..pos - offset + len]);
            pos += len;

            // 写满一块时同步写回，否则延迟写
            if pos % BLOCK_SIZE == 0 {
                cache.write_block(buf)?;
            } else {
                cache.write_delayed(buf);
            }
            self.disk.size = self.disk.size.max(pos as u32);
        }

        Ok(data.len())
    }

    /// 自块地址表末项向前、自索引块末项向前逐一释放
    pub(crate) fn truncate(&mut self, volume: &Volume) -> Result<()> {
        for slot in (0..ADDR_SLOTS).rev() {
            let block = self.disk.addr[slot];
            if block == 0 {
                continue;
            }
            let depth = match slot {
                slot if slot < DIRECT_SLOTS => 0,
                slot if slot < DIRECT_SLOTS + 2 => 1,
                _ => 2,
            };
            free_tree(volume, block, depth)?;
            self.disk.addr[slot] = 0;
            self.flags |= InodeFlag::Update;
        }

        self.disk.size = 0;
        self.disk.mode &= !(Mode::Large as u32);
        self.last_read = None;
        self.flags |= InodeFlag::Update;
        Ok(())
    }

    /// 有修改标记且卷可写时写回磁盘 inode
    pub(crate) fn update(&mut self, volume: &Volume, ino: u32) -> Result<()> {
        if self.flags.is_empty() || volume.is_read_only() {
            return Ok(());
        }
        let now = now();
        if self.flags.contains(InodeFlag::Access) {
            self.disk.atime = now;
        }
        if self.flags.contains(InodeFlag::Update) {
            self.disk.mtime = now;
        }
        volume.write_disk_inode(ino, &self.disk)?;
        self.flags = BitFlags::empty();
        log::debug!("inode {ino} written back");
        Ok(())
    }

    pub(crate) fn set_last_read(&mut self, lbn: u32) {
        self.last_read = Some(lbn);
        self.flags |= InodeFlag::Access;
    }

    pub(crate) fn mark_updated(&mut self) {
        self.flags |= InodeFlag::Update;
    }

    /// 最后一个引用消失：链接数为 0 时删除文件，随后写回
    fn release(&mut self, volume: &Volume, ino: u32) -> Result<()> {
        let delete = self.disk.nlink == 0 && self.disk.mode != 0 && !volume.is_read_only();
        if delete {
            self.truncate(volume)?;
            self.disk.mode = 0;
            self.flags |= InodeFlag::Update;
        }
        self.update(volume, ino)?;
        if delete {
            volume.free_inode(ino);
            log::debug!("inode {ino} deleted");
        }
        Ok(())
    }
}

/// 分配一个清零的盘块并延迟写回
fn alloc_zeroed(volume: &Volume) -> Result<u32> {
    let buf = volume.alloc_block()?;
    let block = buf.block_id();
    volume.cache().write_delayed(buf);
    Ok(block)
}

/// 索引块 `parent` 的第 `entry` 项，为空时视 `allocate` 分配新盘块
fn resolve(volume: &Volume, parent: u32, entry: u32, allocate: bool) -> Result<Option<u32>> {
    let mut buf = volume.read_block(parent)?;
    let child = index_entry(&buf[..], entry);
    if child != 0 || !allocate {
        return Ok((child != 0).then_some(child));
    }

    let child = alloc_zeroed(volume)?;
    set_index_entry(&mut buf[..], entry, child);
    volume.cache().write_delayed(buf);
    Ok(Some(child))
}

/// 释放以 `block` 为根、深 `depth` 的索引树
fn free_tree(volume: &Volume, block: u32, depth: u32) -> Result<()> {
    if depth > 0 {
        let children: Vec<u32> = {
            let buf = volume.read_block(block)?;
            (0..INDEX_COUNT)
                .rev()
                .map(|index| index_entry(&buf[..], index))
                .filter(|&child| child != 0)
                .collect()
        };
        for child in children {
            free_tree(volume, child, depth - 1)?;
        }
    }
    volume.free_block(block)
}
