//! # 卷管理层
//!
//! 一个挂载中的卷：超级块的内存副本、空闲盘块栈、空闲 inode 栈，
//! 以及存活 inode 的登记表。
//!
//! ## 空闲盘块
//!
//! 超级块中的空闲盘块栈至多存放 100 个盘块号，其余的空闲盘块号每 100 个一组，
//! 存放在空闲盘块自身之中，组成一条链：
//!
//! - 分配时弹出栈顶；若栈被取空，弹出的那一块存放着下一组，把它读入栈中；
//! - 释放时压栈；若栈已满，先把整个栈写入被释放的盘块，再让栈只含这一块；
//! - 链尾以盘块号 0 标记，弹出 0 意味着卷已满。
//!
//! 挂载时沿链走一遍，为每个数据盘块记下是否空闲，重复释放由此识别，
//! 无论该盘块位于栈中还是已溢出到链上。
//!
//! ## 空闲 inode
//!
//! 空闲 inode 栈只是一个缓存：栈空时扫描 inode 区，重新收集至多 100 个空闲 inode。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use enumflags2::BitFlags;

use crate::block_cache::{BlockCache, Buf, DeviceId};
use crate::error::Corruption;
use crate::inode::Inode;
use crate::layout::{DATA_ZONE_START, INODE_ZONE_BLOCKS, INODE_ZONE_START, INODES_PER_BLOCK};
use crate::layout::{DirEntry, DiskInode, FreeGroup, Mode, SuperBlock};
use crate::layout::{FAST_STACK_CAP, HAS_DOTS, ROOT_INO, SUPER_BLOCK_SECTOR, SUPER_BLOCK_SECTORS};
use crate::sync::{lock, wait};
use crate::{BLOCK_SIZE, Error, Result};

/// 目录中 "." 与 ".." 的存放方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotLayout {
    /// 每个目录的前两项即 "." 与 ".."
    Embedded,
    /// 磁盘上不存放，由上层自行补出
    Absent,
}

impl DotLayout {
    /// 上层补出的两项在游标中所占的位置
    const SYNTHESIZED: u64 = 2 * DirEntry::SIZE as u64;

    fn from_flag(flag: u32) -> Self {
        if flag == HAS_DOTS {
            Self::Embedded
        } else {
            Self::Absent
        }
    }

    fn flag(self) -> u32 {
        match self {
            Self::Embedded => HAS_DOTS,
            Self::Absent => 0,
        }
    }

    /// 目录文件内偏移对应的游标
    pub fn cursor(self, offset: u32) -> u64 {
        match self {
            Self::Embedded => offset as u64,
            Self::Absent => offset as u64 + Self::SYNTHESIZED,
        }
    }

    /// 游标对应的目录文件内偏移
    pub fn offset(self, cursor: u64) -> u32 {
        let offset = match self {
            Self::Embedded => cursor,
            Self::Absent => cursor.saturating_sub(Self::SYNTHESIZED),
        };
        u32::try_from(offset).unwrap_or(u32::MAX)
    }
}

/// 卷上操作所需的最少缓存块数
///
/// 写路径上一个线程至多同时借出两块：父索引块与新分配的盘块。
pub const MIN_CACHE_SLOTS: usize = 3;

/// 格式化参数
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    /// 卷的总盘块数，须大于数据区起始扇区
    pub total_blocks: u32,
    pub dots: DotLayout,
    pub read_only: bool,
}

/// 挂载中的卷
pub struct Volume {
    cache: Arc<BlockCache>,
    dev: DeviceId,
    inode_blocks: u32,
    total_blocks: u32,
    dots: DotLayout,
    read_only: bool,
    /// 最近一次写回超级块的时间
    time: AtomicU32,
    /// 超级块是否需要写回
    modified: AtomicBool,
    update_lock: Mutex<()>,
    /// 空闲盘块栈，读写盘块期间也一直持有
    free_blocks: Mutex<FreeBlocks>,
    /// 空闲 inode 栈，扫描 inode 区期间也一直持有
    free_inodes: Mutex<FreeGroup>,
    /// 存活的内存 inode；引用已耗尽但尚未释放完毕的仍留在表中
    inodes: Mutex<BTreeMap<u32, Weak<Inode>>>,
    /// 每有一个 inode 释放完毕并离开登记表就通知一次
    retired: Condvar,
}

/// 空闲盘块栈，以及各数据盘块是否空闲
struct FreeBlocks {
    stack: FreeGroup,
    /// 下标为盘块号减去数据区起始扇区
    map: Vec<bool>,
}

impl FreeBlocks {
    fn is_free(&self, block: u32) -> bool {
        self.map[(block - DATA_ZONE_START) as usize]
    }

    fn set_free(&mut self, block: u32, free: bool) {
        self.map[(block - DATA_ZONE_START) as usize] = free;
    }
}

impl Volume {
    fn new(cache: Arc<BlockCache>, dev: DeviceId, sb: SuperBlock, map: Vec<bool>) -> Self {
        Self {
            cache,
            dev,
            inode_blocks: sb.inode_blocks,
            total_blocks: sb.total_blocks,
            dots: DotLayout::from_flag(sb.has_dots),
            read_only: sb.read_only != 0,
            time: AtomicU32::new(sb.time),
            modified: AtomicBool::new(sb.modified != 0),
            update_lock: Mutex::new(()),
            free_blocks: Mutex::new(FreeBlocks {
                stack: sb.free_blocks,
                map,
            }),
            free_inodes: Mutex::new(sb.free_inodes),
            inodes: Mutex::new(BTreeMap::new()),
            retired: Condvar::new(),
        }
    }

    /// 在 `dev` 上建立一个空卷，只含根目录
    pub fn format(cache: &Arc<BlockCache>, dev: DeviceId, options: &FormatOptions) -> Result<()> {
        check_cache(cache)?;
        let total_blocks = options.total_blocks;
        if total_blocks <= DATA_ZONE_START {
            return Err(Corruption::Geometry {
                inode_blocks: INODE_ZONE_BLOCKS,
                total_blocks,
            }
            .into());
        }
        log::info!("format {dev:?}: {total_blocks} blocks, dots {:?}", options.dots);

        for block in INODE_ZONE_START..DATA_ZONE_START {
            let mut buf = cache.get_block(dev, block);
            buf.fill(0);
            cache.write_delayed(buf);
        }

        // 根目录
        let embedded = options.dots == DotLayout::Embedded;
        let now = now();
        let mut root = DiskInode {
            mode: (BitFlags::<Mode>::from_bits_truncate(0o777) | Mode::Alloc | Mode::KindHigh).bits(),
            nlink: if embedded { 2 } else { 1 },
            size: if embedded { 2 * DirEntry::SIZE as u32 } else { 0 },
            atime: now,
            mtime: now,
            ..Default::default()
        };
        root.addr[0] = DATA_ZONE_START;
        let (block, offset) = inode_position(ROOT_INO);
        let mut buf = cache.get_block(dev, block);
        buf.fill(0);
        root.store(&mut buf[offset..offset + DiskInode::SIZE])?;
        cache.write_delayed(buf);

        let mut buf = cache.get_block(dev, DATA_ZONE_START);
        buf.fill(0);
        if embedded {
            for (index, name) in [b".".as_slice(), b"..".as_slice()].into_iter().enumerate() {
                let entry = DirEntry::new(name, HAS_DOTS).ok_or(Error::NameTooLong)?;
                let offset = index * DirEntry::SIZE;
                buf[offset..offset + DirEntry::SIZE].copy_from_slice(&entry.to_bytes());
            }
        }
        cache.write_delayed(buf);

        let mut sb = SuperBlock::new(INODE_ZONE_BLOCKS, total_blocks, options.dots.flag());
        sb.read_only = options.read_only as u32;
        sb.time = now;
        for ino in (1..=FAST_STACK_CAP as u32).rev() {
            sb.free_inodes.push(ino);
        }

        // 由高到低逐块释放，建立空闲盘块链
        let map = vec![false; (total_blocks - DATA_ZONE_START) as usize];
        let volume = Volume::new(Arc::clone(cache), dev, sb, map);
        for block in (DATA_ZONE_START + 1..total_blocks).rev() {
            volume.free_block(block)?;
        }
        volume.write_super(&volume.super_block())?;
        volume.modified.store(false, Ordering::Release);
        cache.flush(Some(dev))
    }

    /// 挂载：读入超级块并校验
    pub fn load(cache: Arc<BlockCache>, dev: DeviceId) -> Result<Arc<Self>> {
        check_cache(&cache)?;
        let mut bytes = [0; SuperBlock::SIZE];
        for (sector, chunk) in (SUPER_BLOCK_SECTOR..).zip(bytes.chunks_exact_mut(BLOCK_SIZE)) {
            let buf = cache.read_block(dev, sector)?;
            chunk.copy_from_slice(&buf[..]);
        }
        let mut sb = SuperBlock::load(&bytes)?;

        if !sb.free_blocks.is_valid() {
            return Err(Corruption::FreeStackHeight(sb.free_blocks.count).into());
        }
        if !sb.free_inodes.is_valid() {
            return Err(Corruption::InodeStackHeight(sb.free_inodes.count).into());
        }
        if sb.inode_blocks == 0
            || sb.inode_blocks > INODE_ZONE_BLOCKS
            || sb.total_blocks <= DATA_ZONE_START
        {
            return Err(Corruption::Geometry {
                inode_blocks: sb.inode_blocks,
                total_blocks: sb.total_blocks,
            }
            .into());
        }

        let map = walk_free_chain(&cache, dev, &sb)?;

        sb.time = now();
        sb.modified = 0;
        log::info!(
            "mount {dev:?}: {} blocks, {} inode blocks, read-only {}",
            sb.total_blocks,
            sb.inode_blocks,
            sb.read_only != 0
        );
        Ok(Arc::new(Self::new(cache, dev, sb, map)))
    }

    /// 写回超级块，随后写回该设备的全部延迟写块
    ///
    /// 已有写回在进行、超级块未修改、任一空闲栈正被使用或卷只读时直接返回。
    pub fn update(&self) -> Result<()> {
        let Ok(_guard) = self.update_lock.try_lock() else {
            return Ok(());
        };
        if !self.modified.load(Ordering::Acquire) || self.read_only {
            return Ok(());
        }
        let sb = {
            let Ok(blocks) = self.free_blocks.try_lock() else {
                return Ok(());
            };
            let Ok(inodes) = self.free_inodes.try_lock() else {
                return Ok(());
            };
            self.modified.store(false, Ordering::Release);
            self.time.store(now(), Ordering::Release);
            self.snapshot(&blocks.stack, &inodes)
        };

        if let Err(err) = self.write_super(&sb) {
            self.modified.store(true, Ordering::Release);
            return Err(err);
        }
        self.cache.flush(Some(self.dev))
    }

    /// 写回超级块与全部延迟写块
    pub fn sync(&self) -> Result<()> {
        self.update()?;
        self.cache.flush(Some(self.dev))
    }

    /// 超级块的快照
    pub fn super_block(&self) -> SuperBlock {
        let blocks = lock(&self.free_blocks);
        let inodes = lock(&self.free_inodes);
        self.snapshot(&blocks.stack, &inodes)
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn device(&self) -> DeviceId {
        self.dev
    }

    pub fn dots(&self) -> DotLayout {
        self.dots
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    pub fn inode_count(&self) -> u32 {
        self.inode_blocks * INODES_PER_BLOCK
    }

    /// 借出本卷的一个盘块，必要时从设备读入
    pub fn read_block(&self, block: u32) -> Result<Buf<'_>> {
        self.cache.read_block(self.dev, block)
    }

    /// 分配一个数据盘块，返回清零后仍处于借出状态的缓存块
    ///
    /// 失败时不改动空闲盘块栈。
    pub fn alloc_block(&self) -> Result<Buf<'_>> {
        let mut free = lock(&self.free_blocks);
        let block = match free.stack.top() {
            Some(0) | None => {
                log::debug!("{:?}: out of free blocks", self.dev);
                return Err(Error::NoSpace);
            }
            Some(block) => block,
        };
        self.check_data_block(block)?;

        if free.stack.len() == 1 {
            // 栈将被取空，这一块存放着下一组空闲盘块号
            let group = {
                let buf = self.read_block(block)?;
                FreeGroup::load(&buf[..FreeGroup::SIZE])?
            };
            if !group.is_valid() {
                return Err(Corruption::FreeStackHeight(group.count).into());
            }
            log::debug!("refill free-block stack from block {block}: {} entries", group.len());
            free.stack = group;
        } else {
            free.stack.pop();
        }
        free.set_free(block, false);
        drop(free);
        self.modified.store(true, Ordering::Release);

        let mut buf = self.cache.get_block(self.dev, block);
        buf.fill(0);
        log::debug!("alloc block {block}");
        Ok(buf)
    }

    /// 释放数据盘块，重复释放已空闲的盘块会被忽略
    pub fn free_block(&self, block: u32) -> Result<()> {
        self.check_data_block(block)?;
        let mut free = lock(&self.free_blocks);
        if free.is_free(block) {
            log::warn!("block {block} is already free");
            return Ok(());
        }

        if free.stack.is_empty() {
            // 链尾标记
            free.stack.push(0);
        }
        if free.stack.is_full() {
            // 整个栈溢出到被释放的盘块中
            let mut buf = self.cache.get_block(self.dev, block);
            buf.fill(0);
            free.stack.store(&mut buf[..FreeGroup::SIZE])?;
            self.cache.write_block(buf)?;
            free.stack = FreeGroup::empty();
            log::debug!("spill free-block stack into block {block}");
        }
        free.stack.push(block);
        free.set_free(block, true);
        self.modified.store(true, Ordering::Release);
        log::debug!("free block {block}");
        Ok(())
    }

    /// 分配一个空闲 inode，返回已清空的内存 inode
    pub fn alloc_inode(self: &Arc<Self>) -> Result<Arc<Inode>> {
        loop {
            let ino = {
                let mut stack = lock(&self.free_inodes);
                if stack.is_empty() {
                    self.scan_free_inodes(&mut stack)?;
                }
                stack.pop().ok_or(Error::NoSpace)?
            };
            self.modified.store(true, Ordering::Release);

            let (inode, fresh) = self.iget_fresh(ino)?;
            if !fresh {
                log::error!("inode {ino} popped from free stack is live in memory");
                return Err(Error::Race(ino));
            }
            if inode.is_allocated() {
                log::warn!("inode {ino} on free stack is in use on disk, skipped");
                continue;
            }
            inode.reset();
            log::debug!("alloc inode {ino}");
            return Ok(inode);
        }
    }

    /// 释放 inode 编号
    ///
    /// 空闲 inode 栈已满或正被使用时不记录，下次扫描 inode 区时会重新发现它。
    pub fn free_inode(&self, ino: u32) {
        let Ok(mut stack) = self.free_inodes.try_lock() else {
            return;
        };
        if stack.contains(ino) {
            log::warn!("inode {ino} is already free");
            return;
        }
        if stack.push(ino) {
            self.modified.store(true, Ordering::Release);
            log::debug!("free inode {ino}");
        }
    }

    /// 取得 inode 编号对应的内存 inode
    pub fn iget(self: &Arc<Self>, ino: u32) -> Result<Arc<Inode>> {
        Ok(self.iget_fresh(ino)?.0)
    }

    pub fn root(self: &Arc<Self>) -> Result<Arc<Inode>> {
        self.iget(ROOT_INO)
    }

    /// 持有登记表执行 `release`，随后把 `ino` 移出登记表
    ///
    /// 释放期间 [`Volume::iget`] 等待，不会从磁盘读到尚未写回的旧 inode。
    pub(crate) fn retire(&self, ino: u32, release: impl FnOnce()) {
        let mut table = lock(&self.inodes);
        release();
        if table.get(&ino).is_some_and(|inode| inode.strong_count() == 0) {
            table.remove(&ino);
        }
        drop(table);
        self.retired.notify_all();
    }

    /// 该 inode 是否存活于内存中
    pub fn is_live(&self, ino: u32) -> bool {
        lock(&self.inodes)
            .get(&ino)
            .is_some_and(|inode| inode.strong_count() > 0)
    }
}

impl Volume {
    fn snapshot(&self, blocks: &FreeGroup, inodes: &FreeGroup) -> SuperBlock {
        let mut sb = SuperBlock::new(self.inode_blocks, self.total_blocks, self.dots.flag());
        sb.free_blocks = blocks.clone();
        sb.free_inodes = inodes.clone();
        sb.modified = self.is_modified() as u32;
        sb.read_only = self.read_only as u32;
        sb.time = self.time.load(Ordering::Acquire);
        sb
    }

    /// 同步写入超级块的两个扇区
    fn write_super(&self, sb: &SuperBlock) -> Result<()> {
        let mut bytes = [0; SuperBlock::SIZE];
        sb.store(&mut bytes)?;
        for (sector, chunk) in (SUPER_BLOCK_SECTOR..SUPER_BLOCK_SECTOR + SUPER_BLOCK_SECTORS)
            .zip(bytes.chunks_exact(BLOCK_SIZE))
        {
            let mut buf = self.cache.get_block(self.dev, sector);
            buf.copy_from_slice(chunk);
            self.cache.write_block(buf)?;
        }
        log::debug!("{:?}: super block written", self.dev);
        Ok(())
    }

    fn check_data_block(&self, block: u32) -> Result<()> {
        if (DATA_ZONE_START..self.total_blocks).contains(&block) {
            Ok(())
        } else {
            Err(Corruption::BadBlock(block).into())
        }
    }

    /// 扫描 inode 区，收集未使用且不在内存中的 inode
    fn scan_free_inodes(&self, stack: &mut FreeGroup) -> Result<()> {
        for block in 0..self.inode_blocks {
            // 先记下候选者并归还缓存块，再查询 inode 表
            let candidates: Vec<u32> = {
                let buf = self.read_block(INODE_ZONE_START + block)?;
                (0..INODES_PER_BLOCK)
                    .filter(|&slot| {
                        let offset = slot as usize * DiskInode::SIZE;
                        buf[offset..offset + 4] == [0; 4]
                    })
                    .map(|slot| block * INODES_PER_BLOCK + slot)
                    .collect()
            };
            for ino in candidates {
                if self.is_live(ino) {
                    continue;
                }
                stack.push(ino);
                if stack.is_full() {
                    log::debug!("inode scan refilled {} entries", stack.len());
                    return Ok(());
                }
            }
        }
        log::debug!("inode scan refilled {} entries", stack.len());
        Ok(())
    }

    fn iget_fresh(self: &Arc<Self>, ino: u32) -> Result<(Arc<Inode>, bool)> {
        if ino >= self.inode_count() {
            return Err(Corruption::BadInode(ino).into());
        }
        let mut table = lock(&self.inodes);
        loop {
            let entry = table.get(&ino).map(Weak::upgrade);
            match entry {
                Some(Some(inode)) => return Ok((inode, false)),
                // 最后一个引用刚刚消失，等它释放完毕
                Some(None) => table = wait(&self.retired, table),
                None => break,
            }
        }

        let disk = self.read_disk_inode(ino)?;
        let inode = Arc::new(Inode::new(Arc::clone(self), ino, disk));
        table.insert(ino, Arc::downgrade(&inode));
        log::debug!("load inode {ino}");
        Ok((inode, true))
    }

    pub(crate) fn read_disk_inode(&self, ino: u32) -> Result<DiskInode> {
        let (block, offset) = inode_position(ino);
        let buf = self.read_block(block)?;
        DiskInode::load(&buf[offset..offset + DiskInode::SIZE])
    }

    /// 同步写回磁盘 inode
    pub(crate) fn write_disk_inode(&self, ino: u32, disk: &DiskInode) -> Result<()> {
        let (block, offset) = inode_position(ino);
        let mut buf = self.read_block(block)?;
        disk.store(&mut buf[offset..offset + DiskInode::SIZE])?;
        self.cache.write_block(buf)
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            log::error!("{:?}: sync on unmount failed: {err}", self.dev);
        }
        log::info!("unmount {:?}", self.dev);
    }
}

fn check_cache(cache: &BlockCache) -> Result<()> {
    match cache.capacity() {
        slots if slots < MIN_CACHE_SLOTS => Err(Error::CacheTooSmall(slots)),
        _ => Ok(()),
    }
}

/// 沿空闲盘块链走一遍，记下每个空闲盘块
///
/// 每组的栈底即下一组所在的盘块，0 为链尾。越界或重复出现的盘块号视为损坏。
fn walk_free_chain(cache: &BlockCache, dev: DeviceId, sb: &SuperBlock) -> Result<Vec<bool>> {
    let mut map = vec![false; (sb.total_blocks - DATA_ZONE_START) as usize];
    let mut group = sb.free_blocks.clone();
    let mut groups = 1;
    while let Some(&link) = group.as_slice().first() {
        for &block in group.as_slice().iter().filter(|&&block| block != 0) {
            if !(DATA_ZONE_START..sb.total_blocks).contains(&block) {
                return Err(Corruption::BadBlock(block).into());
            }
            let free = &mut map[(block - DATA_ZONE_START) as usize];
            if *free {
                return Err(Corruption::FreeBlockTwice(block).into());
            }
            *free = true;
        }
        if link == 0 {
            break;
        }

        group = {
            let buf = cache.read_block(dev, link)?;
            FreeGroup::load(&buf[..FreeGroup::SIZE])?
        };
        if !group.is_valid() {
            return Err(Corruption::FreeStackHeight(group.count).into());
        }
        groups += 1;
    }
    log::debug!("{dev:?}: free-block chain of {groups} groups");
    Ok(map)
}

/// inode 所在的扇区与扇区内偏移
fn inode_position(ino: u32) -> (u32, usize) {
    (
        INODE_ZONE_START + ino / INODES_PER_BLOCK,
        (ino % INODES_PER_BLOCK) as usize * DiskInode::SIZE,
    )
}

/// 当前时间（秒）
pub(crate) fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as u32)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use block_dev::{BlockDevice, RamDisk};

    use super::*;
    use crate::CacheConfig;

    fn mount(total_blocks: u32) -> Arc<Volume> {
        let disk = Arc::new(RamDisk::new(BLOCK_SIZE, total_blocks as usize));
        let cache = Arc::new(BlockCache::new(CacheConfig::default()));
        let dev = cache.attach(disk);
        let options = FormatOptions {
            total_blocks,
            dots: DotLayout::Embedded,
            read_only: false,
        };
        Volume::format(&cache, dev, &options).unwrap();
        Volume::load(cache, dev).unwrap()
    }

    /// 取尽全部空闲盘块，每块只出现一次
    fn drain(volume: &Volume) -> BTreeSet<u32> {
        let mut seen = BTreeSet::new();
        loop {
            match volume.alloc_block() {
                Ok(buf) => assert!(seen.insert(buf.block_id()), "block {} handed out twice", buf.block_id()),
                Err(Error::NoSpace) => return seen,
                Err(err) => panic!("{err}"),
            }
        }
    }

    #[test]
    fn dot_layout_cursor() {
        assert_eq!(DotLayout::Embedded.cursor(96), 96);
        assert_eq!(DotLayout::Absent.cursor(0), 64);
        assert_eq!(DotLayout::Absent.offset(96), 32);
        assert_eq!(DotLayout::Absent.offset(0), 0);
        assert_eq!(DotLayout::from_flag(HAS_DOTS), DotLayout::Embedded);
        assert_eq!(DotLayout::from_flag(0), DotLayout::Absent);
    }

    #[test]
    fn free_chain_hands_out_every_block_once() {
        // 跨越若干个溢出组
        let volume = mount(1400);
        assert_eq!(drain(&volume), (DATA_ZONE_START + 1..1400).collect::<BTreeSet<_>>());
        assert_eq!(volume.super_block().free_blocks.as_slice(), [0]);
    }

    #[test]
    fn spill_and_refill() {
        let volume = mount(1100);
        let blocks: Vec<u32> = (0..75)
            .map(|_| {
                let buf = volume.alloc_block().unwrap();
                let block = buf.block_id();
                volume.cache().write_delayed(buf);
                block
            })
            .collect();
        assert!(matches!(volume.alloc_block(), Err(Error::NoSpace)));

        for &block in &blocks {
            volume.free_block(block).unwrap();
        }
        // 0 号标记加上 75 块，未溢出
        assert_eq!(volume.super_block().free_blocks.len(), 76);

        let again: BTreeSet<u32> = (0..75)
            .map(|_| volume.alloc_block().unwrap().block_id())
            .collect();
        assert_eq!(again, blocks.into_iter().collect::<BTreeSet<_>>());
    }

    #[test]
    fn corrupted_stack_height_is_rejected() {
        let disk = Arc::new(RamDisk::new(BLOCK_SIZE, 2048));
        let cache = Arc::new(BlockCache::new(CacheConfig::default()));
        let dev = cache.attach(disk.clone());
        let options = FormatOptions {
            total_blocks: 2048,
            dots: DotLayout::Embedded,
            read_only: false,
        };
        Volume::format(&cache, dev, &options).unwrap();

        // 空闲盘块栈的栈高紧随两个尺寸字段
        let mut sector = disk.snapshot(SUPER_BLOCK_SECTOR as usize);
        sector[8..12].copy_from_slice(&101u32.to_le_bytes());
        disk.write_block(SUPER_BLOCK_SECTOR as usize, &sector).unwrap();

        let cache = Arc::new(BlockCache::new(CacheConfig::default()));
        let dev = cache.attach(disk);
        assert!(matches!(
            Volume::load(cache, dev),
            Err(Error::Corrupted(Corruption::FreeStackHeight(101)))
        ));
    }

    #[test]
    fn double_free_after_spill_is_ignored() {
        let disk = Arc::new(RamDisk::new(BLOCK_SIZE, 1400));
        let cache = Arc::new(BlockCache::new(CacheConfig::default()));
        let dev = cache.attach(disk.clone());
        let options = FormatOptions {
            total_blocks: 1400,
            dots: DotLayout::Embedded,
            read_only: false,
        };
        Volume::format(&cache, dev, &options).unwrap();
        let volume = Volume::load(cache, dev).unwrap();

        let held: Vec<u32> = (0..150)
            .map(|_| volume.alloc_block().unwrap().block_id())
            .collect();
        for &block in &held {
            volume.free_block(block).unwrap();
        }
        // 第一块早已随溢出离开栈
        assert!(!volume.super_block().free_blocks.contains(held[0]));
        volume.free_block(held[0]).unwrap();
        volume.sync().unwrap();

        // 重新挂载后仍能识别
        drop(volume);
        let cache = Arc::new(BlockCache::new(CacheConfig::default()));
        let dev = cache.attach(disk);
        let volume = Volume::load(cache, dev).unwrap();
        volume.free_block(held[0]).unwrap();
        volume.free_block(held[149]).unwrap();

        assert_eq!(drain(&volume), (DATA_ZONE_START + 1..1400).collect::<BTreeSet<_>>());
    }

    #[test]
    fn free_chain_with_repeated_block_is_rejected() {
        let disk = Arc::new(RamDisk::new(BLOCK_SIZE, 2048));
        let cache = Arc::new(BlockCache::new(CacheConfig::default()));
        let dev = cache.attach(disk.clone());
        let options = FormatOptions {
            total_blocks: 2048,
            dots: DotLayout::Embedded,
            read_only: false,
        };
        Volume::format(&cache, dev, &options).unwrap();

        // 栈顶两项改成同一块
        let sector = SUPER_BLOCK_SECTOR as usize;
        let mut bytes = [disk.snapshot(sector), disk.snapshot(sector + 1)].concat();
        let mut sb = SuperBlock::load(&bytes).unwrap();
        let top = sb.free_blocks.pop().unwrap();
        sb.free_blocks.pop();
        sb.free_blocks.push(top);
        sb.free_blocks.push(top);
        sb.store(&mut bytes).unwrap();
        disk.write_block(sector, &bytes[..BLOCK_SIZE]).unwrap();

        let cache = Arc::new(BlockCache::new(CacheConfig::default()));
        let dev = cache.attach(disk);
        assert!(matches!(
            Volume::load(cache, dev),
            Err(Error::Corrupted(Corruption::FreeBlockTwice(block))) if block == top
        ));
    }

    #[test]
    fn small_cache_is_rejected() {
        let cache = Arc::new(BlockCache::new(CacheConfig { slots: 2 }));
        let dev = cache.attach(Arc::new(RamDisk::new(BLOCK_SIZE, 2048)));
        let options = FormatOptions {
            total_blocks: 2048,
            dots: DotLayout::Embedded,
            read_only: false,
        };
        assert!(matches!(
            Volume::format(&cache, dev, &options),
            Err(Error::CacheTooSmall(2))
        ));
        assert!(matches!(Volume::load(cache, dev), Err(Error::CacheTooSmall(2))));
    }

    #[test]
    fn update_clears_modified() {
        let volume = mount(2048);
        assert!(!volume.is_modified());
        let block = volume.alloc_block().unwrap().block_id();
        assert!(volume.is_modified());
        volume.update().unwrap();
        assert!(!volume.is_modified());
        assert!(!volume.super_block().free_blocks.contains(block));
    }
}
