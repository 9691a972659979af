//! 进程协作接口
//!
//! 调度器不属于缓冲区缓存。这里只保留缓存依赖的三件事：当前硬件线程编号、
//! 在某个通道上休眠、唤醒某个通道上的全部休眠者。宿主环境下每个 OS 线程
//! 视为一个硬件线程，休眠以线程 park/unpark 实现。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use crate::spinlock::{SpinLock, SpinLockGuard};

static NEXT_HART: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static HART_ID: usize = NEXT_HART.fetch_add(1, Ordering::Relaxed);
}

/// 返回当前硬件线程的编号。
///
/// 编号在线程第一次调用时分配，之后保持不变，且不同线程之间互不相同。
#[inline]
pub fn cpu_id() -> usize {
    HART_ID.with(|id| *id)
}

/// 一个正在某通道上休眠的执行流
struct Sleeper {
    channel: usize,
    thread: Thread,
    woken: Arc<AtomicBool>,
}

/// 全部休眠者。锁顺序：条件锁在前，本表在后。
static SLEEPERS: SpinLock<Vec<Sleeper>> = SpinLock::new(Vec::new(), "sleepers");

/// 原子地释放条件锁 `guard` 并在 `channel` 上休眠，直到被 [`wakeup`] 唤醒。
///
/// # 流程解释
/// 1. 先获取休眠表的锁，再释放条件锁。唤醒方必须先拿到条件锁才能修改条件，
///    随后还要获取休眠表的锁，因此释放条件锁之后发生的唤醒一定能看到本次登记；
/// 2. 登记完成后释放休眠表的锁，park 直到 `woken` 被置位（park 可能伪唤醒）。
///
/// 返回时不持有条件锁，调用方需要重新获取并再次检查条件。
pub fn sleep<T: ?Sized>(channel: usize, guard: SpinLockGuard<'_, T>) {
    let woken = Arc::new(AtomicBool::new(false));
    let mut table = SLEEPERS.lock();
    drop(guard);

    table.push(Sleeper {
        channel,
        thread: thread::current(),
        woken: Arc::clone(&woken),
    });
    drop(table);

    while !woken.load(Ordering::Acquire) {
        thread::park();
    }
}

/// 唤醒所有在 `channel` 上休眠的执行流。
///
/// 调用方通常持有与该通道对应的条件锁。
pub fn wakeup(channel: usize) {
    let mut table = SLEEPERS.lock();
    table.retain(|s| {
        if s.channel == channel {
            s.woken.store(true, Ordering::Release);
            s.thread.unpark();
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn cpu_ids_differ_between_threads() {
        let here = cpu_id();
        assert_eq!(here, cpu_id());
        let there = thread::spawn(cpu_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn sleep_until_wakeup() {
        static COND: SpinLock<bool> = SpinLock::new(false, "cond");
        let chan = &COND as *const _ as usize;
        let (tx, rx) = mpsc::channel();

        let sleeper = thread::spawn(move || {
            let mut guard = COND.lock();
            while !*guard {
                sleep(chan, guard);
                guard = COND.lock();
            }
            tx.send(()).unwrap();
        });

        // 条件未满足前休眠者不应返回
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        let mut guard = COND.lock();
        *guard = true;
        wakeup(chan);
        drop(guard);

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        sleeper.join().unwrap();
    }

    #[test]
    fn wakeup_only_wakes_its_channel() {
        static FIRST: SpinLock<bool> = SpinLock::new(false, "first");
        static SECOND: SpinLock<bool> = SpinLock::new(false, "second");

        fn wait_on(cond: &'static SpinLock<bool>, tx: mpsc::Sender<()>) -> thread::JoinHandle<()> {
            thread::spawn(move || {
                let chan = cond as *const _ as usize;
                let guard = cond.lock();
                // 只睡一次：被错误的通道唤醒也会立刻暴露
                if !*guard {
                    sleep(chan, guard);
                }
                tx.send(()).unwrap();
            })
        }

        fn signal(cond: &'static SpinLock<bool>) {
            let mut guard = cond.lock();
            *guard = true;
            wakeup(cond as *const _ as usize);
            drop(guard);
        }

        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        let first = wait_on(&FIRST, tx1);
        let second = wait_on(&SECOND, tx2);
        assert!(rx1.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(rx2.recv_timeout(Duration::from_millis(50)).is_err());

        signal(&FIRST);
        rx1.recv_timeout(Duration::from_secs(5)).unwrap();
        first.join().unwrap();
        // 另一个通道上的休眠者仍在睡
        assert!(rx2.recv_timeout(Duration::from_millis(100)).is_err());

        signal(&SECOND);
        rx2.recv_timeout(Duration::from_secs(5)).unwrap();
        second.join().unwrap();
    }
}
