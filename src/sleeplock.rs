//! 睡眠锁模块
//! 提供基于休眠/唤醒机制的同步原语，适用于可能长时间持有的锁。
//!
//! 当锁被占用时，尝试获取锁的执行流会进入休眠状态，避免忙等待。
//! 每个缓冲区的数据都由一把睡眠锁保护：持有者可能要等待一次磁盘传输。

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};

use crate::process::{self, cpu_id};
use crate::spinlock::SpinLock;

/// 睡眠锁的状态，由内部自旋锁保护
struct SleepState {
    /// 锁是否已被占用
    locked: bool,
    /// 持有者的硬件线程编号（-1 表示无人持有）
    holder: isize,
}

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，当锁被占用时，尝试获取的执行流会进入休眠状态，
/// 直到锁被释放后被唤醒。
///
/// # 字段说明
/// - `state`: 内部自旋锁，保护占用状态与持有者
/// - `name`: 锁的标识名称，用于诊断
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    state: SpinLock<SleepState>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            state: SpinLock::new(SleepState { locked: false, holder: -1 }, "sleeplock"),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查占用状态：
    ///   - 如果已锁定：在本锁的通道上休眠，被唤醒后重新检查
    ///   - 如果未锁定：记录持有者并返回守卫
    /// 3. 释放内部自旋锁（占用状态已设置，数据由睡眠锁本身保护）
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.state.lock();
        while guard.locked {
            process::sleep(self.channel(), guard);
            guard = self.state.lock();
        }
        guard.locked = true;
        guard.holder = cpu_id() as isize;
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 当前执行流是否持有该睡眠锁
    pub fn holding(&self) -> bool {
        let guard = self.state.lock();
        guard.locked && guard.holder == cpu_id() as isize
    }

    /// 锁的名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    ///
    /// 标记锁为可用并唤醒在本锁通道上休眠的全部执行流。
    fn unlock(&self) {
        let mut guard = self.state.lock();
        if !guard.locked || guard.holder != cpu_id() as isize {
            drop(guard);
            panic!("sleeplock {} release", self.name);
        }
        guard.locked = false;
        guard.holder = -1;
        process::wakeup(self.channel());
        drop(guard);
    }

    /// 休眠通道：内部自旋锁的地址
    fn channel(&self) -> usize {
        &self.state as *const _ as usize
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有；守卫离开作用域时自动释放锁。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    /// 守卫对应的睡眠锁
    pub fn sleeplock(&self) -> &'a SleepLock<T> {
        self.lock
    }
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
