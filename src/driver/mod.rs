//! 块设备驱动

mod ramdisk;

pub use ramdisk::RamDisk;

use crate::error::Result;
use crate::fs::BufData;

/// 块设备接口
///
/// 缓冲区缓存通过它同步地读写一个块。块大小固定为 [`BSIZE`](crate::consts::fs::BSIZE)，
/// 地址由 `(dev, blockno)` 给出。调用方在传输期间持有该缓冲区的睡眠锁，
/// 因此实现可以阻塞；失败原样返回给 `bread` / `bwrite` 的调用者，本层不重试。
pub trait BlockDevice: Send + Sync {
    /// 读写一个块
    ///
    /// # 参数
    /// - `dev`: 设备号
    /// - `blockno`: 块号
    /// - `data`: 缓冲区数据；读时被填充，写时被写出
    /// - `writing`: `true` 为写入磁盘，`false` 为从磁盘读取
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) -> Result<()>;
}
