//! 文件系统模块
//!
//! 这里只包含块缓存这一层；日志、inode 与目录等上层建立在 [`Buf`] 之上。

use std::sync::{Arc, OnceLock};

use crate::clock::Clock;
use crate::driver::BlockDevice;
use crate::error::{BioError, Result};

mod bio;
mod bucket;

pub use bio::{Bcache, BcacheConfig, Buf, BufData, BufFlags, CacheStats};
pub use bucket::bucket_of;

static BCACHE: OnceLock<Bcache> = OnceLock::new();

/// 初始化全局缓冲区缓存。
///
/// 必须在系统启动时、任何文件系统操作之前调用且只调用一次；
/// 重复调用返回 [`BioError::AlreadyInitialized`]，已有的缓存保持不变。
pub fn binit(
    config: BcacheConfig,
    disk: Arc<dyn BlockDevice>,
    clock: Arc<dyn Clock>,
) -> Result<&'static Bcache> {
    let cache = Bcache::new(config, disk, clock)?;
    BCACHE.set(cache).map_err(|_| BioError::AlreadyInitialized)?;
    Ok(bcache())
}

/// 全局缓冲区缓存。
///
/// # 可能的错误
/// 在 [`binit`] 之前调用会 panic。
pub fn bcache() -> &'static Bcache {
    match BCACHE.get() {
        Some(cache) => cache,
        None => panic!("bcache: used before binit"),
    }
}
