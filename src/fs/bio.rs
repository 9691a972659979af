//! 缓存层
//!
//! 缓冲区缓存是一个固定大小的缓冲区池，缓存磁盘块的副本，同时也是
//! 多个执行流访问同一磁盘块时的同步点。
//!
//! 接口：
//! * 要获取某个磁盘块的缓冲区，调用 [`Bcache::bread`]。
//! * 修改缓冲区数据之后，调用 [`Buf::bwrite`] 写回磁盘。
//! * 用完缓冲区后调用 [`Buf::brelse`]（或直接丢弃 `Buf`）。
//! * 同一时刻只有一个执行流能使用某个缓冲区，不要长时间持有。
//!
//! 锁：
//! * 每个桶一把自旋锁，保护桶内链表以及成员的键与引用计数；
//! * 一把全局回收锁，保证任意时刻至多一个执行流在挑选被回收的缓冲区；
//! * 每个缓冲区一把睡眠锁，保护数据与有效位。

use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::consts::fs::{BSIZE, NBUCKET, NBUF};
use crate::driver::BlockDevice;
use crate::error::{BioError, Result};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::{SpinLock, SpinLockGuard};

use super::bucket::{bucket_of, Bucket, BufCtrl};

/// 缓冲区缓存的规模配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcacheConfig {
    /// 缓冲区数量，即同时驻留的不同块数的上限
    pub nbuf: usize,
    /// 映射桶数量
    pub nbucket: usize,
}

impl Default for BcacheConfig {
    fn default() -> Self {
        Self { nbuf: NBUF, nbucket: NBUCKET }
    }
}

impl BcacheConfig {
    /// 设置缓冲区数量
    pub fn nbuf(mut self, nbuf: usize) -> Self {
        self.nbuf = nbuf;
        self
    }

    /// 设置映射桶数量
    pub fn nbucket(mut self, nbucket: usize) -> Self {
        self.nbucket = nbucket;
        self
    }

    /// 检查配置是否可用
    ///
    /// # 功能说明
    /// 缓冲区与映射桶都至少要有一个；[`Bcache::new`] 在分配缓冲池前会先调用本方法。
    ///
    /// # 返回值
    /// - `Ok(())`: 配置合法
    /// - `Err(BioError::InvalidConfig)`: 缓冲区数量或桶数量为 0
    pub fn validate(&self) -> Result<()> {
        if self.nbuf == 0 {
            return Err(BioError::InvalidConfig("nbuf must be at least 1"));
        }
        if self.nbucket == 0 {
            return Err(BioError::InvalidConfig("nbucket must be at least 1"));
        }
        Ok(())
    }
}

/// 缓存统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 查找命中次数（含回收锁下的二次检查命中）
    pub hits: u64,
    /// 未命中、需要挑选回收缓冲区的次数
    pub misses: u64,
    /// 被回收的缓冲区跨桶迁移的次数
    pub relocations: u64,
    /// 磁盘读次数
    pub disk_reads: u64,
    /// 磁盘写次数
    pub disk_writes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    relocations: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

impl Counters {
    #[inline]
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
        }
    }
}

/// 缓冲区缓存（Buffer Cache），块设备的读写缓存。
///
/// `Bcache` 提供了一个固定大小的内存缓冲区池。缓冲区按 `(dev, blockno)`
/// 散列进若干个桶，每个桶有自己的自旋锁，因此命中不同桶的查找互不阻塞；
/// 未命中时由全局回收锁串行化“挑选最久未使用的空闲缓冲区并重新绑定”
/// 这一过程，保证同一个块不会同时有两份缓存。
///
/// 该结构在内核初始化阶段构造一次，之后贯穿整个运行期间；构造完成后不再分配内存。
pub struct Bcache {
    /// 映射桶，每个桶一把自旋锁
    buckets: Box<[SpinLock<Bucket>]>,

    /// 回收锁：同一时刻至多一个执行流在挑选并绑定被回收的缓冲区
    eviction: SpinLock<()>,

    /// 缓冲区控制信息（键、引用计数、最近释放时间、桶内链接）
    ctrls: Box<[BufCtrl]>,

    /// 缓冲区数据与状态位，与 `ctrls` 按下标一一对应
    bufs: Box<[BufInner]>,

    disk: Arc<dyn BlockDevice>,
    clock: Arc<dyn Clock>,
    stats: Counters,
}

impl Bcache {
    /// 构造缓冲区缓存，所有缓冲区初始都未绑定、引用计数为 0，并全部挂在 0 号桶上。
    ///
    /// # 可能的错误
    /// - 配置非法时返回 [`BioError::InvalidConfig`]。
    pub fn new(
        config: BcacheConfig,
        disk: Arc<dyn BlockDevice>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let buckets: Box<[_]> = (0..config.nbucket)
            .map(|_| SpinLock::new(Bucket::new(), "bcache_bufmap"))
            .collect();
        let ctrls: Box<[_]> = (0..config.nbuf).map(|_| BufCtrl::new()).collect();
        let bufs: Box<[_]> = (0..config.nbuf).map(|_| BufInner::new()).collect();

        {
            let mut bucket = buckets[0].lock();
            for index in 0..config.nbuf {
                bucket.push_front(&ctrls, index);
            }
        }

        info!(
            "bcache: {} buffers, {} buckets, block size {}",
            config.nbuf, config.nbucket, BSIZE
        );
        #[cfg(feature = "verbose_init_info")]
        info!(
            "bcache: {} bytes of block data, ~{} buffers per bucket",
            config.nbuf * BSIZE,
            (config.nbuf + config.nbucket - 1) / config.nbucket
        );

        Ok(Self {
            buckets,
            eviction: SpinLock::new((), "bcache_eviction"),
            ctrls,
            bufs,
            disk,
            clock,
            stats: Counters::default(),
        })
    }

    /// 缓冲区数量
    pub fn nbuf(&self) -> usize {
        self.ctrls.len()
    }

    /// 映射桶数量
    pub fn nbucket(&self) -> usize {
        self.buckets.len()
    }

    /// 统计信息快照
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    #[inline]
    fn hash(&self, dev: u32, blockno: u32) -> usize {
        bucket_of(dev, blockno, self.buckets.len())
    }

    /// 查找或分配 `(dev, blockno)` 对应的缓冲区，返回时已持有其睡眠锁。
    ///
    /// # 流程解释
    /// 1. 锁住键所在的桶并查找，命中则引用计数加一、解锁桶，再去等睡眠锁；
    /// 2. 未命中：解锁桶，获取回收锁；
    /// 3. 在回收锁下重新检查目标桶，期间别的执行流可能已经绑定了这个键；
    /// 4. 按桶号升序扫描所有桶，找出引用计数为 0 且最近释放时间最小的缓冲区，
    ///    扫描结束时只持有该缓冲区所在桶的锁；
    /// 5. 若它不在目标桶中，从原桶摘除、释放原桶锁、锁住目标桶并插到头部，
    ///    然后设置键、引用计数为 1、有效位清零，释放桶锁与回收锁，再去等睡眠锁。
    ///
    /// 每一步持有的自旋锁都在等待睡眠锁之前释放。
    ///
    /// # 可能的错误
    /// 所有缓冲区都被引用时无法回收，直接 panic（`"bget: no buffers"`）。
    fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let key = self.hash(dev, blockno);

        // 块是否已经缓存
        let bucket = self.buckets[key].lock();
        if let Some(index) = bucket.find(&self.ctrls, dev, blockno) {
            let ctrl = &self.ctrls[index];
            ctrl.set_refcnt(ctrl.refcnt() + 1);
            drop(bucket);
            Counters::inc(&self.stats.hits);
            trace!("bcache: hit dev {} block {} in buf {}", dev, blockno, index);
            return self.locked(index, dev, blockno);
        }
        drop(bucket);

        let eviction = self.eviction.lock();

        // 在获得回收锁之前，别的执行流可能已经缓存了该块
        let bucket = self.buckets[key].lock();
        if let Some(index) = bucket.find(&self.ctrls, dev, blockno) {
            let ctrl = &self.ctrls[index];
            ctrl.set_refcnt(ctrl.refcnt() + 1);
            drop(bucket);
            drop(eviction);
            Counters::inc(&self.stats.hits);
            trace!("bcache: late hit dev {} block {} in buf {}", dev, blockno, index);
            return self.locked(index, dev, blockno);
        }
        drop(bucket);

        // 未缓存，回收最近最少使用的空闲缓冲区
        let victim = match self.find_victim() {
            Some(victim) => victim,
            None => {
                error!(
                    "bcache: all {} buffers referenced, cannot cache dev {} block {}",
                    self.nbuf(),
                    dev,
                    blockno
                );
                panic!("bget: no buffers");
            }
        };

        let index = self.bind(victim, key, dev, blockno);
        drop(eviction);

        Counters::inc(&self.stats.misses);
        self.locked(index, dev, blockno)
    }

    /// 把选中的缓冲区迁移到目标桶 `key` 并绑定到 `(dev, blockno)`，返回其下标。
    ///
    /// 返回时已释放所有桶锁，引用计数为 1，有效位已清除。
    /// 调用方必须持有回收锁。
    fn bind(&self, victim: Victim<'_>, key: usize, dev: u32, blockno: u32) -> usize {
        let Victim { bucket: from, mut guard, prev, index, .. } = victim;
        if from != key {
            guard.unlink(&self.ctrls, prev, index);
            drop(guard);
            guard = self.buckets[key].lock();
            guard.push_front(&self.ctrls, index);
            Counters::inc(&self.stats.relocations);
        }

        let ctrl = &self.ctrls[index];
        if ctrl.is_bound() {
            debug!(
                "bcache: recycle buf {} (dev {} block {}, bucket {}) for dev {} block {} (bucket {})",
                index,
                ctrl.dev(),
                ctrl.blockno(),
                from,
                dev,
                blockno,
                key
            );
        } else {
            debug!("bcache: bind fresh buf {} to dev {} block {}", index, dev, blockno);
        }
        ctrl.bind(dev, blockno);
        // 引用计数为 0 的缓冲区没有持有者，可以直接清除有效位
        self.bufs[index].remove(BufFlags::VALID);
        drop(guard);
        index
    }

    /// 按桶号升序扫描全部桶，找出引用计数为 0 且最近释放时间最小的缓冲区。
    ///
    /// 扫描时要么不持有桶锁，要么只持有当前桶左侧某个桶的锁，
    /// 因此不会出现循环等待。返回时只持有被选中缓冲区所在桶的锁。
    /// 时间戳相同时先扫描到的获胜：桶号小者优先，其次是链表中靠前者。
    ///
    /// 调用方必须持有回收锁。
    fn find_victim(&self) -> Option<Victim<'_>> {
        debug_assert!(self.eviction.holding());

        let mut best: Option<Victim<'_>> = None;
        for (i, lock) in self.buckets.iter().enumerate() {
            let guard = lock.lock();
            let mut least = best.as_ref().map(|v| v.lastuse);
            let mut found = None;
            for (prev, index) in guard.iter(&self.ctrls) {
                let ctrl = &self.ctrls[index];
                if ctrl.refcnt() != 0 {
                    continue;
                }
                let lastuse = ctrl.lastuse();
                if least.map_or(true, |least| lastuse < least) {
                    least = Some(lastuse);
                    found = Some((prev, index, lastuse));
                }
            }
            match found {
                // 保持本桶的锁，同时释放之前持有的桶锁
                Some((prev, index, lastuse)) => {
                    best = Some(Victim { bucket: i, guard, prev, index, lastuse })
                }
                None => drop(guard),
            }
        }
        best
    }

    /// 等待并获取缓冲区的睡眠锁。调用方已为本次获取增加了引用计数。
    fn locked(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    /// 读取 `(dev, blockno)` 对应的块，返回持有睡眠锁的缓冲区。
    ///
    /// 若缓冲区数据尚未从磁盘加载，先发起一次磁盘读取并设置有效位。
    ///
    /// # 可能的错误
    /// - 磁盘读取失败时返回该错误；缓冲区保持无效并被释放，下次读取会重新访问磁盘。
    /// - 所有缓冲区都被引用时 panic（`"bget: no buffers"`）。
    pub fn bread(&self, dev: u32, blockno: u32) -> Result<Buf<'_>> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].flags().contains(BufFlags::VALID) {
            self.rw(&mut b, false)?;
            self.bufs[b.index].insert(BufFlags::VALID);
        }
        Ok(b)
    }

    /// 让块设备读写缓冲区，传输期间置 `DISK` 位。
    fn rw(&self, b: &mut Buf<'_>, writing: bool) -> Result<()> {
        let inner = &self.bufs[b.index];
        let (dev, blockno) = (b.dev, b.blockno);
        inner.insert(BufFlags::DISK);
        let ret = self.disk.rw(dev, blockno, b.guard_mut(), writing);
        inner.remove(BufFlags::DISK);

        match &ret {
            Ok(()) if writing => Counters::inc(&self.stats.disk_writes),
            Ok(()) => Counters::inc(&self.stats.disk_reads),
            Err(e) => warn!(
                "bcache: disk {} failed for dev {} block {}: {}",
                if writing { "write" } else { "read" },
                dev,
                blockno,
                e
            ),
        }
        ret
    }

    /// 释放一次引用。调用方已经释放了缓冲区的睡眠锁。
    ///
    /// 桶由缓冲区当前的键重新计算；持有引用期间键不会改变。
    /// 引用计数归零时记录当前时钟值，作为回收时的 LRU 依据。
    fn brelse(&self, index: usize) {
        let ctrl = &self.ctrls[index];
        let key = self.hash(ctrl.dev(), ctrl.blockno());
        let bucket = self.buckets[key].lock();
        let refcnt = ctrl.refcnt();
        if refcnt == 0 {
            drop(bucket);
            error!("bcache: buf {} released with no references", index);
            panic!("brelse: refcnt underflow");
        }
        ctrl.set_refcnt(refcnt - 1);
        if refcnt == 1 {
            ctrl.set_lastuse(self.clock.ticks());
        }
        drop(bucket);
    }

    fn bpin(&self, index: usize) {
        let ctrl = &self.ctrls[index];
        let key = self.hash(ctrl.dev(), ctrl.blockno());
        let bucket = self.buckets[key].lock();
        ctrl.set_refcnt(ctrl.refcnt() + 1);
        drop(bucket);
    }

    fn bunpin(&self, index: usize) {
        let ctrl = &self.ctrls[index];
        let key = self.hash(ctrl.dev(), ctrl.blockno());
        let bucket = self.buckets[key].lock();
        let refcnt = ctrl.refcnt();
        // 调用方的 Buf 自身还占着一个引用
        if refcnt <= 1 {
            drop(bucket);
            error!("bcache: unpin of buf {} without a matching pin", index);
            panic!("buf unpin not match");
        }
        ctrl.set_refcnt(refcnt - 1);
        drop(bucket);
    }

    /// 查询 `(dev, blockno)` 当前的引用计数；未缓存时返回 `None`。
    pub fn refcnt(&self, dev: u32, blockno: u32) -> Option<usize> {
        let bucket = self.buckets[self.hash(dev, blockno)].lock();
        bucket
            .find(&self.ctrls, dev, blockno)
            .map(|index| self.ctrls[index].refcnt())
    }

    /// 当前驻留（已绑定）的全部块，按 `(dev, blockno)` 排序。
    ///
    /// 逐个桶加锁收集，并发修改时结果只是近似快照。
    pub fn resident(&self) -> Vec<(u32, u32)> {
        let mut keys = Vec::with_capacity(self.nbuf());
        for lock in self.buckets.iter() {
            let bucket = lock.lock();
            keys.extend(
                bucket
                    .iter(&self.ctrls)
                    .map(|(_, index)| &self.ctrls[index])
                    .filter(|ctrl| ctrl.is_bound())
                    .map(|ctrl| (ctrl.dev(), ctrl.blockno())),
            );
        }
        keys.sort_unstable();
        keys
    }

    /// 第 `bucket` 个桶中的缓冲区个数；桶号越界时返回 `None`。
    pub fn bucket_len(&self, bucket: usize) -> Option<usize> {
        self.buckets
            .get(bucket)
            .map(|lock| lock.lock().len(&self.ctrls))
    }
}

impl fmt::Debug for Bcache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bcache")
            .field("nbuf", &self.nbuf())
            .field("nbucket", &self.nbucket())
            .field("stats", &self.stats())
            .finish()
    }
}

/// 回收扫描选中的缓冲区，连同它所在桶的锁
struct Victim<'a> {
    bucket: usize,
    guard: SpinLockGuard<'a, Bucket>,
    prev: Option<usize>,
    index: usize,
    lastuse: usize,
}

bitflags! {
    /// 缓冲区状态位
    pub struct BufFlags: u8 {
        /// 数据已从磁盘读入，与磁盘内容一致
        const VALID = 1 << 0;
        /// 块设备正在使用该缓冲区进行传输
        const DISK = 1 << 1;
    }
}

/// 缓冲块的数据部分及其状态位。
///
/// 状态位只在持有数据的睡眠锁时修改；唯一的例外是回收绑定时清除
/// `VALID`，那时缓冲区的引用计数为 0，不可能有持有者。
struct BufInner {
    flags: AtomicU8,
    data: SleepLock<BufData>,
}

impl BufInner {
    fn new() -> Self {
        Self {
            flags: AtomicU8::new(BufFlags::empty().bits()),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }

    fn flags(&self) -> BufFlags {
        BufFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn insert(&self, flags: BufFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    fn remove(&self, flags: BufFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
}

/// 已锁定的缓冲区，代表一个 `(dev, blockno)` 磁盘块。
///
/// `Buf` 持有数据的睡眠锁，在生命周期结束时自动释放睡眠锁并归还引用。
/// 它不能跨线程移动：睡眠锁记录的持有者是获取它的执行流。
pub struct Buf<'a> {
    cache: &'a Bcache,
    /// 缓冲区在缓冲池中的下标
    index: usize,
    dev: u32,
    blockno: u32,
    /// 在 `Buf` 生命周期内始终为 `Some`，`Drop` 时先取出释放睡眠锁
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a> Buf<'a> {
    /// 获取缓冲区对应的设备号
    ///
    /// # 返回值
    /// 获取本缓冲区时传给 [`Bcache::bread`] 的 `dev`
    pub fn read_dev(&self) -> u32 {
        self.dev
    }

    /// 获取缓冲区对应的磁盘块号
    ///
    /// # 功能说明
    /// 持有 `Buf` 期间引用计数不为 0，缓冲区不会被回收，块号保持不变。
    ///
    /// # 返回值
    /// 获取本缓冲区时传给 [`Bcache::bread`] 的 `blockno`
    pub fn read_blockno(&self) -> u32 {
        self.blockno
    }

    /// 缓冲区在缓冲池中的下标，可用来判断两个句柄是否是同一个缓冲区
    pub fn index(&self) -> usize {
        self.index
    }

    /// 缓冲区状态位
    pub fn flags(&self) -> BufFlags {
        self.cache.bufs[self.index].flags()
    }

    /// 只读访问缓冲区数据
    ///
    /// # 功能说明
    /// 数据受睡眠锁保护，`Buf` 存在期间始终持有该锁，因此可以直接借出引用。
    ///
    /// # 返回值
    /// 整个块（[`BSIZE`] 字节）的数据引用
    pub fn data(&self) -> &BufData {
        match &self.data {
            Some(guard) => &**guard,
            None => panic!("buf: data accessed after release"),
        }
    }

    /// 可写访问缓冲区数据
    ///
    /// # 功能说明
    /// 修改只发生在内存中，需要调用 [`Buf::bwrite`] 才会写回磁盘。
    ///
    /// # 返回值
    /// 整个块（[`BSIZE`] 字节）的可变数据引用
    pub fn data_mut(&mut self) -> &mut BufData {
        self.guard_mut()
    }

    fn guard_mut(&mut self) -> &mut BufData {
        match &mut self.data {
            Some(guard) => &mut **guard,
            None => panic!("buf: data accessed after release"),
        }
    }

    fn holding(&self) -> bool {
        self.data.is_some() && self.cache.bufs[self.index].data.holding()
    }

    /// 把缓冲区数据写回磁盘。必须持有睡眠锁。
    ///
    /// 不释放锁也不改变引用计数，可以在释放前多次调用。
    pub fn bwrite(&mut self) -> Result<()> {
        if !self.holding() {
            error!("bcache: bwrite of buf {} without its lock", self.index);
            panic!("bwrite");
        }
        let cache = self.cache;
        cache.rw(self, true)
    }

    /// 释放缓冲区：先释放睡眠锁，再归还引用。必须持有睡眠锁。
    ///
    /// 消耗 `self`，同一次获取不可能被释放两次。
    pub fn brelse(self) {
        if !self.holding() {
            error!("bcache: brelse of buf {} without its lock", self.index);
            panic!("brelse");
        }
        drop(self);
    }

    /// 引用计数加一，使该块在本句柄释放后仍驻留缓存、不会被回收。
    ///
    /// 与 [`Buf::unpin`] 配对使用，可跨越多次独立的 `bread`/`brelse`。
    pub fn pin(&self) {
        self.cache.bpin(self.index);
    }

    /// 撤销一次 [`Buf::pin`]。
    ///
    /// # 可能的错误
    /// 没有与之配对的 `pin` 时 panic（`"buf unpin not match"`）。
    pub fn unpin(&self) {
        self.cache.bunpin(self.index);
    }
}

impl<'a> fmt::Debug for Buf<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("index", &self.index)
            .field("dev", &self.dev)
            .field("blockno", &self.blockno)
            .field("flags", &self.flags())
            .finish()
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        if let Some(guard) = self.data.take() {
            drop(guard);
            self.cache.brelse(self.index);
        }
    }
}

/// BufData 的对齐方式应足以满足可能由此结构体转换而来的其他结构体的需求。
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Default for BufData {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
