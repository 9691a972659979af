//! 逻辑时钟
//!
//! 缓冲区缓存只读取时钟，用于给引用计数归零的缓冲区打上最近释放时间戳；
//! 推进时钟的是外部的定时器中断。

use core::num::Wrapping;

use crate::spinlock::SpinLock;

/// 单调递增的逻辑时钟
pub trait Clock: Send + Sync {
    /// 读取当前时钟计数值
    fn ticks(&self) -> usize;
}

/// 时钟中断驱动的滴答计数器（自旋锁保护）
pub struct Ticks {
    ticks: SpinLock<Wrapping<usize>>,
}

impl Ticks {
    pub const fn new() -> Self {
        Self {
            ticks: SpinLock::new(Wrapping(0), "time"),
        }
    }

    /// 处理时钟中断（更新计数器）
    ///
    /// 由定时器中断处理程序调用；测试中由测试代码手动调用来推进时间。
    pub fn clock_intr(&self) {
        let mut guard = self.ticks.lock();
        *guard += Wrapping(1);
        drop(guard);
    }

    /// 读取当前时钟计数值
    ///
    /// # 返回值
    /// 系统启动以来的时钟周期数
    pub fn clock_read(&self) -> usize {
        self.ticks.lock().0
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for Ticks {
    fn ticks(&self) -> usize {
        self.clock_read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_intr_advances() {
        let t = Ticks::new();
        assert_eq!(t.ticks(), 0);
        t.clock_intr();
        t.clock_intr();
        assert_eq!(t.clock_read(), 2);
        assert_eq!(t.ticks(), 2);
    }
}
