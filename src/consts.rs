//! 内核常量

/// 文件系统相关常量
pub mod fs {
    /// 磁盘块大小（字节）
    pub const BSIZE: usize = 1024;

    /// 默认的缓冲区缓存块数量
    pub const NBUF: usize = 30;

    /// 默认的缓冲区映射桶数量
    ///
    /// 取素数，使 `(dev << 27) | blockno` 形式的键在各桶之间分布均匀。
    pub const NBUCKET: usize = 13;

    /// 散列时设备号左移的位数
    pub const DEV_SHIFT: usize = 27;
}
