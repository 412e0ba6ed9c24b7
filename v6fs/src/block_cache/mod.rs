//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟固定数量的缓存块，
//! 把即将操作的块复制到内存中，提高对块设备的操作效率。
//!
//! 每个缓存块任一时刻至多对应一个 (设备, 块号)，且同一 (设备, 块号) 至多对应一个缓存块。
//! 缓存块同时挂在两条队列上：
//!
//! - 设备队列：该块当前所属设备的队列，尚未分配设备的块挂在 NODEV 队列上；
//! - 自由队列：未被借出的块，队头是最早释放的块，优先被重新分配。
//!
//! 使用者通过 [`Buf`] 独占地借出缓存块，[`Buf`] 析构时归还到自由队列队尾。
//! 延迟写的块只在被重新分配或被 [`BlockCache::flush`] 时才真正写回设备。

mod queue;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use block_dev::BlockDevice;

use self::queue::Chains;
use crate::DataBlock;
use crate::Result;
use crate::sync;
use crate::sync::Semaphore;
use crate::BLOCK_SIZE;

/// 块缓存配置
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// 缓存块个数
    pub slots: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { slots: 15 }
    }
}

/// 已挂接到缓存上的设备号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(usize);

/// 缓存块内容的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// 内容无效，使用前须从设备读入
    Free,
    /// 正在从设备读入
    Reading,
    /// 正在写回设备
    Writing,
    /// 与设备一致
    Clean,
    /// 已修改但尚未写回
    DirtyDelayed,
}

impl SlotState {
    /// 内容是否可以直接使用
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Clean | Self::DirtyDelayed)
    }
}

/// 缓存块状态的快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotView {
    pub index: usize,
    pub busy: bool,
    pub state: SlotState,
}

/// 缓存块的控制信息
#[derive(Debug)]
struct Slot {
    binding: Option<(DeviceId, u32)>,
    busy: bool,
    state: SlotState,
}

/// 缓存块表，由自旋锁保护，只在修改队列与状态时短暂持有
struct Table {
    slots: Vec<Slot>,
    /// 设备队列，锚点依次是 NODEV 与各个设备
    queues: Chains,
    nodev: usize,
    devices: Vec<(usize, Arc<dyn BlockDevice>)>,
    /// 自由队列
    free: Chains,
    free_anchor: usize,
}

/// 固定容量的块缓存
pub struct BlockCache {
    table: spin::Mutex<Table>,
    /// 缓存块数据，互斥锁即缓存块的独占使用权
    data: Box<[Mutex<Box<DataBlock>>]>,
    /// 每释放一个缓存块就增加一个许可
    freed: Semaphore,
}

impl BlockCache {
    pub fn new(config: CacheConfig) -> Self {
        let n = config.slots.max(1);
        let mut queues = Chains::new(n);
        let nodev = queues.add_anchor();
        let mut free = Chains::new(n);
        let free_anchor = free.add_anchor();
        for index in 0..n {
            queues.push_back(nodev, index);
            free.push_back(free_anchor, index);
        }

        Self {
            table: spin::Mutex::new(Table {
                slots: (0..n)
                    .map(|_| Slot {
                        binding: None,
                        busy: false,
                        state: SlotState::Free,
                    })
                    .collect(),
                queues,
                nodev,
                devices: Vec::new(),
                free,
                free_anchor,
            }),
            data: (0..n)
                .map(|_| Mutex::new(Box::new([0; BLOCK_SIZE])))
                .collect(),
            freed: Semaphore::new(0, n),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// 挂接设备，为其建立设备队列
    pub fn attach(&self, device: Arc<dyn BlockDevice>) -> DeviceId {
        let mut table = self.table.lock();
        let anchor = table.queues.add_anchor();
        table.devices.push((anchor, device));
        let id = DeviceId(table.devices.len() - 1);
        log::debug!("attach device {id:?}");
        id
    }

    /// 借出 (dev, block) 对应的缓存块，内容不保证有效
    ///
    /// 若该块已被他人借出，等其归还后重新检索；
    /// 若没有空闲缓存块，等任意一块归还后重新检索。
    ///
    /// 被重新分配的块若是延迟写的，先写回设备。写回失败时只记录 `error!`，
    /// 该块的修改随之丢弃，缓存块照常改作他用；需要确认落盘的调用者应使用
    /// [`BlockCache::write_block`] 或 [`BlockCache::flush`]。
    pub fn get_block(&self, dev: DeviceId, block: u32) -> Buf<'_> {
        loop {
            let mut table = self.table.lock();

            if let Some(index) = table.lookup(dev, block) {
                if table.slots[index].busy {
                    drop(table);
                    log::trace!("{dev:?}#{block}: wait for slot {index}");
                    // 待持有者归还后，绑定关系可能已经改变
                    drop(self.lock_data(index));
                    continue;
                }
                table.checkout(index);
                drop(table);
                log::trace!("{dev:?}#{block}: hit slot {index}");
                return self.buf(index, dev, block);
            }

            let Some(index) = table.free.first(table.free_anchor) else {
                drop(table);
                log::trace!("{dev:?}#{block}: wait for any free slot");
                self.freed.down();
                continue;
            };

            table.checkout(index);
            let slot = &table.slots[index];
            if let (SlotState::DirtyDelayed, Some((old_dev, old_block))) = (slot.state, slot.binding) {
                drop(table);
                // 延迟写的块先写回，再重新检索
                log::trace!("{old_dev:?}#{old_block}: flush slot {index} before reuse");
                let buf = self.buf(index, old_dev, old_block);
                if let Err(err) = self.write_block(buf) {
                    log::error!("{old_dev:?}#{old_block}: delayed write failed: {err}");
                }
                continue;
            }

            table.rebind(index, dev, block);
            drop(table);
            log::trace!("{dev:?}#{block}: rebind slot {index}");
            return self.buf(index, dev, block);
        }
    }

    /// 借出 (dev, block) 对应的缓存块，必要时从设备读入
    ///
    /// 读失败时缓存块归还后再返回错误。
    pub fn read_block(&self, dev: DeviceId, block: u32) -> Result<Buf<'_>> {
        let mut buf = self.get_block(dev, block);

        let device = {
            let mut table = self.table.lock();
            let slot = &mut table.slots[buf.index];
            if slot.state.is_valid() {
                None
            } else {
                slot.state = SlotState::Reading;
                Some(table.device(dev))
            }
        };
        let Some(device) = device else {
            return Ok(buf);
        };

        let result = device.read_block(block as usize, &mut buf[..]);
        self.set_state(buf.index, result.is_ok(), SlotState::Clean);
        match result {
            Ok(()) => Ok(buf),
            Err(err) => {
                log::error!("{dev:?}#{block}: read failed: {err}");
                drop(buf);
                Err(err.into())
            }
        }
    }

    /// 同步写回并归还缓存块
    pub fn write_block(&self, buf: Buf<'_>) -> Result<()> {
        let device = {
            let mut table = self.table.lock();
            // 先作废原有状态，写到一半崩溃不会被当作写成功
            table.slots[buf.index].state = SlotState::Writing;
            table.device(buf.dev)
        };

        let result = device.write_block(buf.block as usize, &buf[..]);
        self.set_state(buf.index, result.is_ok(), SlotState::Clean);
        if let Err(err) = &result {
            log::error!("{:?}#{}: write failed: {err}", buf.dev, buf.block);
        }
        drop(buf);
        result.map_err(Into::into)
    }

    /// 标记为延迟写并归还缓存块，不发起 I/O
    pub fn write_delayed(&self, buf: Buf<'_>) {
        self.table.lock().slots[buf.index].state = SlotState::DirtyDelayed;
    }

    /// 归还缓存块
    pub fn release(&self, buf: Buf<'_>) {
        drop(buf);
    }

    /// 写回自由队列中所有属于 `dev` 的延迟写块，`dev` 为 `None` 时写回全部
    ///
    /// 返回遇到的第一个写错误，出错的块不会被重试。
    pub fn flush(&self, dev: Option<DeviceId>) -> Result<()> {
        let mut first_err = None;
        loop {
            let (index, owner, block) = {
                let mut table = self.table.lock();
                let found = table.free.iter(table.free_anchor).find_map(|index| {
                    let slot = &table.slots[index];
                    match slot.binding {
                        Some((owner, block))
                            if slot.state == SlotState::DirtyDelayed
                                && dev.is_none_or(|dev| dev == owner) =>
                        {
                            Some((index, owner, block))
                        }
                        _ => None,
                    }
                });
                let Some(found) = found else {
                    break;
                };
                table.checkout(found.0);
                found
            };

            // 写回期间队列可能改变，每写一块都从头扫描
            let buf = self.buf(index, owner, block);
            if let Err(err) = self.write_block(buf) {
                first_err.get_or_insert(err);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// 查询 (dev, block) 是否在缓存中，无副作用
    pub fn in_core(&self, dev: DeviceId, block: u32) -> Option<SlotView> {
        let table = self.table.lock();
        table.lookup(dev, block).map(|index| SlotView {
            index,
            busy: table.slots[index].busy,
            state: table.slots[index].state,
        })
    }
}

impl BlockCache {
    fn lock_data(&self, index: usize) -> MutexGuard<'_, Box<DataBlock>> {
        sync::lock(&self.data[index])
    }

    fn buf(&self, index: usize, dev: DeviceId, block: u32) -> Buf<'_> {
        Buf {
            cache: self,
            index,
            dev,
            block,
            data: self.lock_data(index),
        }
    }

    fn set_state(&self, index: usize, ok: bool, state: SlotState) {
        self.table.lock().slots[index].state = if ok { state } else { SlotState::Free };
    }

    /// 归还第 `index` 个缓存块：先修改队列，再唤醒等待者
    fn release_slot(&self, index: usize) {
        let mut table = self.table.lock();
        if !table.slots[index].busy {
            log::warn!("release of idle slot {index} ignored");
            return;
        }
        table.slots[index].busy = false;
        let anchor = table.free_anchor;
        table.free.push_back(anchor, index);
        drop(table);

        self.freed.up();
    }
}

impl Table {
    fn device(&self, dev: DeviceId) -> Arc<dyn BlockDevice> {
        Arc::clone(&self.devices[dev.0].1)
    }

    fn lookup(&self, dev: DeviceId, block: u32) -> Option<usize> {
        let anchor = self.devices[dev.0].0;
        self.queues
            .iter(anchor)
            .find(|&index| self.slots[index].binding == Some((dev, block)))
    }

    /// 标记为借出并移出自由队列
    fn checkout(&mut self, index: usize) {
        self.slots[index].busy = true;
        self.free.unlink(index);
    }

    /// 改绑到新的 (dev, block)，移入对应设备队列的队头
    fn rebind(&mut self, index: usize, dev: DeviceId, block: u32) {
        let slot = &mut self.slots[index];
        slot.binding = Some((dev, block));
        slot.state = SlotState::Free;
        let anchor = self.devices[dev.0].0;
        self.queues.push_front(anchor, index);
    }
}

/// 借出的缓存块，析构时归还
pub struct Buf<'a> {
    cache: &'a BlockCache,
    index: usize,
    dev: DeviceId,
    block: u32,
    data: MutexGuard<'a, Box<DataBlock>>,
}

impl Buf<'_> {
    pub fn block_id(&self) -> u32 {
        self.block
    }

    pub fn device(&self) -> DeviceId {
        self.dev
    }

    pub fn state(&self) -> SlotState {
        self.cache.table.lock().slots[self.index].state
    }
}

impl Deref for Buf<'_> {
    type Target = DataBlock;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Buf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // 数据锁随后释放，唤醒等待该块的线程
        self.cache.release_slot(self.index);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use block_dev::RamDisk;

    use super::*;

    fn setup(slots: usize) -> (BlockCache, Arc<RamDisk>, DeviceId) {
        let cache = BlockCache::new(CacheConfig { slots });
        let disk = Arc::new(RamDisk::new(BLOCK_SIZE, 64));
        let dev = cache.attach(disk.clone());
        (cache, disk, dev)
    }

    impl BlockCache {
        /// 自由队列合法、借出状态与自由队列一致、每块恰在一条设备队列中、绑定唯一
        fn assert_consistent(&self) {
            let table = self.table.lock();
            assert!(table.free.is_consistent(table.free_anchor));

            let anchors: Vec<_> = std::iter::once((table.nodev, None))
                .chain(
                    table
                        .devices
                        .iter()
                        .enumerate()
                        .map(|(id, &(anchor, _))| (anchor, Some(DeviceId(id)))),
                )
                .collect();
            let mut membership = vec![0; table.slots.len()];
            for &(anchor, dev) in &anchors {
                assert!(table.queues.is_consistent(anchor));
                for index in table.queues.iter(anchor) {
                    membership[index] += 1;
                    assert_eq!(table.slots[index].binding.map(|(dev, _)| dev), dev);
                }
            }
            assert!(membership.iter().all(|&count| count == 1));

            let mut bindings = Vec::new();
            for (index, slot) in table.slots.iter().enumerate() {
                assert_eq!(table.free.is_linked(index), !slot.busy, "slot {index}");
                bindings.extend(slot.binding);
            }
            let total = bindings.len();
            bindings.sort();
            bindings.dedup();
            assert_eq!(bindings.len(), total);
        }
    }

    #[test]
    fn one_slot_per_block() {
        let (cache, _, dev) = setup(4);
        let index = cache.get_block(dev, 7).index;
        assert_eq!(cache.get_block(dev, 7).index, index);
        assert_eq!(cache.in_core(dev, 7).map(|view| view.index), Some(index));
        assert_eq!(cache.in_core(dev, 8), None);
        cache.assert_consistent();
    }

    #[test]
    fn read_hits_do_not_touch_device() {
        let (cache, disk, dev) = setup(4);
        disk.write_block(3, &[0xab; BLOCK_SIZE]).unwrap();

        let buf = cache.read_block(dev, 3).unwrap();
        assert_eq!(buf[100], 0xab);
        assert_eq!(buf.state(), SlotState::Clean);
        drop(buf);

        let buf = cache.read_block(dev, 3).unwrap();
        assert!(buf.iter().all(|&byte| byte == 0xab));
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn delayed_write_reaches_device_on_reuse() {
        let (cache, disk, dev) = setup(1);
        let mut buf = cache.get_block(dev, 5);
        buf.fill(0x11);
        cache.write_delayed(buf);
        assert_eq!(disk.writes(), 0);
        assert_eq!(
            cache.in_core(dev, 5).map(|view| view.state),
            Some(SlotState::DirtyDelayed)
        );

        // 唯一的缓存块被改作他用前先写回
        drop(cache.get_block(dev, 6));
        assert_eq!(disk.writes(), 1);
        assert_eq!(disk.snapshot(5), vec![0x11; BLOCK_SIZE]);
        assert_eq!(cache.in_core(dev, 5), None);
        cache.assert_consistent();
    }

    #[test]
    fn failed_delayed_write_is_dropped_on_reuse() {
        let (cache, disk, dev) = setup(1);
        let mut buf = cache.get_block(dev, 5);
        buf.fill(0x22);
        cache.write_delayed(buf);
        disk.set_faulty(5, true);

        let buf = cache.get_block(dev, 6);
        assert_eq!(buf.block_id(), 6);
        drop(buf);
        assert_eq!(cache.in_core(dev, 5), None);
        cache.assert_consistent();

        disk.set_faulty(5, false);
        assert_eq!(disk.snapshot(5), vec![0; BLOCK_SIZE]);
        assert_eq!(disk.writes(), 0);
    }

    #[test]
    fn flush_writes_only_requested_device() {
        let cache = BlockCache::new(CacheConfig { slots: 4 });
        let a = Arc::new(RamDisk::new(BLOCK_SIZE, 8));
        let b = Arc::new(RamDisk::new(BLOCK_SIZE, 8));
        let dev_a = cache.attach(a.clone());
        let dev_b = cache.attach(b.clone());

        for (dev, block) in [(dev_a, 1), (dev_a, 2), (dev_b, 1)] {
            let mut buf = cache.get_block(dev, block);
            buf.fill(block as u8);
            cache.write_delayed(buf);
        }

        cache.flush(Some(dev_a)).unwrap();
        assert_eq!((a.writes(), b.writes()), (2, 0));
        cache.flush(None).unwrap();
        assert_eq!((a.writes(), b.writes()), (2, 1));
        assert_eq!(b.snapshot(1), vec![1; BLOCK_SIZE]);
        cache.assert_consistent();
    }

    #[test]
    fn failed_read_releases_slot() {
        let (cache, disk, dev) = setup(2);
        disk.set_faulty(9, true);
        assert!(cache.read_block(dev, 9).is_err());
        let view = cache.in_core(dev, 9).unwrap();
        assert!(!view.busy);
        assert_eq!(view.state, SlotState::Free);
        cache.assert_consistent();

        // 坏块修复后重新读入
        disk.set_faulty(9, false);
        assert!(cache.read_block(dev, 9).is_ok());
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn double_release_is_ignored() {
        let (cache, _, dev) = setup(3);
        let index = cache.get_block(dev, 1).index;
        cache.release_slot(index);
        cache.release_slot(index);
        cache.assert_consistent();
        let table = cache.table.lock();
        assert_eq!(table.free.iter(table.free_anchor).count(), 3);
    }

    #[test]
    fn free_list_reuses_oldest_release() {
        let (cache, _, dev) = setup(3);
        let first = cache.get_block(dev, 1);
        let second = cache.get_block(dev, 2);
        let (first_index, second_index) = (first.index, second.index);
        drop(second);
        drop(first);

        // 从未使用过的块排在最前，其后依次是 2 号块与 1 号块
        drop(cache.get_block(dev, 3));
        assert_eq!(cache.get_block(dev, 4).index, second_index);
        assert!(cache.in_core(dev, 2).is_none());
        assert_eq!(cache.in_core(dev, 1).map(|view| view.index), Some(first_index));
    }

    #[test]
    fn waiter_blocks_until_block_released() {
        let (cache, _, dev) = setup(2);
        let released = AtomicBool::new(false);

        thread::scope(|s| {
            let mut held = cache.get_block(dev, 4);
            held[0] = 42;
            let waiter = s.spawn(|| {
                let buf = cache.get_block(dev, 4);
                assert!(released.load(Ordering::SeqCst));
                buf[0]
            });
            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            drop(held);
            assert_eq!(waiter.join().unwrap(), 42);
        });
        cache.assert_consistent();
    }

    #[test]
    fn waiter_blocks_until_any_slot_released() {
        let (cache, _, dev) = setup(2);
        let released = AtomicBool::new(false);

        thread::scope(|s| {
            let a = cache.get_block(dev, 1);
            let b = cache.get_block(dev, 2);
            let waiter = s.spawn(|| {
                let buf = cache.get_block(dev, 3);
                assert!(released.load(Ordering::SeqCst));
                buf.block_id()
            });
            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            drop(a);
            assert_eq!(waiter.join().unwrap(), 3);
            drop(b);
        });
        cache.assert_consistent();
    }

    #[test]
    fn concurrent_writers_keep_tables_consistent() {
        let (cache, disk, dev) = setup(3);

        thread::scope(|s| {
            for worker in 0..6u32 {
                let cache = &cache;
                s.spawn(move || {
                    for round in 0..50u32 {
                        let block = (worker * 7 + round) % 16;
                        let mut buf = cache.read_block(dev, block).unwrap();
                        buf[0] = buf[0].wrapping_add(1);
                        if round % 3 == 0 {
                            cache.write_block(buf).unwrap();
                        } else {
                            cache.write_delayed(buf);
                        }
                    }
                });
            }
        });

        cache.flush(None).unwrap();
        cache.assert_consistent();
        let total: u32 = (0..16).map(|block| disk.snapshot(block)[0] as u32).sum();
        assert_eq!(total, 6 * 50);
    }
}
