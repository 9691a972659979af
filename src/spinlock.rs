//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::hint;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::process::cpu_id;

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的硬件线程将在循环中等待，直到锁被释放。
/// 该锁还跟踪持有锁的硬件线程编号，用于发现重入导致的自死锁。
///
/// 缓冲区缓存中的桶锁与回收串行锁都是自旋锁：临界区很短，且持有期间
/// 绝不进入可能阻塞的等待。
///
/// # 字段说明
/// - `lock`: 锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于诊断信息；
/// - `cpuid`: 当前持有锁的硬件线程编号（-1 表示无人持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于诊断。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// # 功能说明
    /// 通过忙等待获取锁的所有权，返回一个守卫对象。
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 示例
    /// ```
    /// use xv6_bcache::spinlock::SpinLock;
    ///
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// assert_eq!(*lock.lock(), 42);
    /// ```
    ///
    /// # 可能的错误
    /// 同一硬件线程重复获取同一把锁会立即 panic，而不是永远自旋。
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
            _not_send: PhantomData,
        }
    }

    /// 锁的名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 检查当前硬件线程是否持有此锁。
    pub fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == cpu_id() as isize
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 检查是否已持有锁（防止自死锁）；
    /// 2. 使用原子比较交换（CAS）忙等待获取锁；
    /// 3. 获取成功后设置内存屏障；
    /// 4. 记录当前硬件线程编号。
    fn acquire(&self) {
        if self.holding() {
            panic!("spinlock {} acquire", self.name);
        }
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        fence(Ordering::SeqCst);
        self.cpuid.store(cpu_id() as isize, Ordering::Relaxed);
    }

    /// 释放锁的核心实现（内部方法）。
    ///
    /// 此方法不直接对外暴露，通过守卫的`Drop`实现自动调用。
    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {} release", self.name);
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁。
///
/// 守卫不能跨线程移动：锁记录的持有者是获取它的硬件线程。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁。
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// 守卫对应的锁，用作休眠通道等身份标识。
    pub fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

/// 从spin crate借鉴 (https://crates.io/crates/spin)
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn smoke() {
        let m = SpinLock::new((), "smoke");
        m.lock();
        m.lock();
    }

    #[test]
    fn holding_tracks_owner() {
        let m = SpinLock::new(0usize, "owner");
        assert!(!m.holding());
        let guard = m.lock();
        assert!(m.holding());
        assert!(guard.spinlock().holding());
        drop(guard);
        assert!(!m.holding());
    }

    #[test]
    #[should_panic(expected = "spinlock reentry acquire")]
    fn reentry_panics() {
        let m = SpinLock::new((), "reentry");
        let _a = m.lock();
        let _b = m.lock();
    }

    #[test]
    fn lots_and_lots() {
        const J: usize = 1000;
        const K: usize = 4;

        let m = Arc::new(SpinLock::new(0usize, "lots"));
        let handles: Vec<_> = (0..K)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..J {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), J * K);
    }
}
