//! xv6-rust 块缓存子系统
//!
//! 内核文件系统与块设备之间的缓冲层：固定大小的缓冲区池、按 `(dev, blockno)`
//! 散列的分桶目录、全局唯一的回收串行锁，以及每个缓冲区独占使用的睡眠锁。
//!
//! 调度器、陷阱处理与虚拟内存不属于本 crate；它们在这里只以
//! [`process`]（休眠/唤醒）、[`clock`]（时钟滴答）和 [`driver`]（块设备）
//! 三个协作接口出现。

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

pub mod consts;
pub mod error;
pub mod clock;
pub mod driver;
pub mod fs;
pub mod process;
pub mod sleeplock;
pub mod spinlock;

pub use clock::{Clock, Ticks};
pub use driver::{BlockDevice, RamDisk};
pub use error::{BioError, Result};
pub use fs::{bcache, binit, Bcache, BcacheConfig, Buf, BufData, BufFlags, CacheStats};
