//! 错误类型定义
//!
//! 缓冲区缓存中只有块设备故障与配置错误会以 `Err` 的形式返回；
//! 资源耗尽与使用违规属于编程错误，直接 `panic!`。

use thiserror::Error;

/// 块缓存及其块设备协作者返回的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BioError {
    /// 块设备读写失败
    #[error("disk I/O failed on dev {dev} block {blockno}: {reason}")]
    Io {
        dev: u32,
        blockno: u32,
        reason: &'static str,
    },

    /// 块号超出设备容量
    #[error("block {blockno} out of range for dev {dev} ({nblocks} blocks)")]
    OutOfRange {
        dev: u32,
        blockno: u32,
        nblocks: u32,
    },

    /// 设备号未注册
    #[error("no such device: {0}")]
    NoDevice(u32),

    /// 缓存配置非法
    #[error("invalid buffer cache configuration: {0}")]
    InvalidConfig(&'static str),

    /// 全局缓存重复初始化
    #[error("buffer cache already initialized")]
    AlreadyInitialized,
}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, BioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_block() {
        let err = BioError::Io { dev: 1, blockno: 7, reason: "media error" };
        assert_eq!(err.to_string(), "disk I/O failed on dev 1 block 7: media error");

        let err = BioError::OutOfRange { dev: 2, blockno: 100, nblocks: 64 };
        assert_eq!(err.to_string(), "block 100 out of range for dev 2 (64 blocks)");
    }
}
