//! 内存盘
//!
//! 以内存数组模拟的块设备，供没有真实磁盘的宿主环境与测试使用。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::consts::fs::BSIZE;
use crate::error::{BioError, Result};
use crate::fs::BufData;
use crate::spinlock::SpinLock;

use super::BlockDevice;

/// 内存盘：每个设备号对应一段连续的块数组
pub struct RamDisk {
    devices: SpinLock<BTreeMap<u32, Vec<u8>>>,
    /// 每次传输前的模拟延迟（微秒）
    latency_us: AtomicUsize,
    faulty: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new() -> Self {
        Self {
            devices: SpinLock::new(BTreeMap::new(), "ramdisk"),
            latency_us: AtomicUsize::new(0),
            faulty: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// 挂上一个容量为 `nblocks` 块、内容全零的设备
    pub fn with_device(self, dev: u32, nblocks: u32) -> Self {
        self.add_device(dev, nblocks);
        self
    }

    /// 挂上一个容量为 `nblocks` 块、内容全零的设备；已存在则替换
    pub fn add_device(&self, dev: u32, nblocks: u32) {
        let storage = vec![0u8; nblocks as usize * BSIZE];
        self.devices.lock().insert(dev, storage);
    }

    /// 设置每次传输的模拟延迟，用于放大并发测试中的竞争窗口
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us.store(latency.as_micros() as usize, Ordering::Relaxed);
    }

    /// 打开后所有传输都以 I/O 错误失败
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::Relaxed);
    }

    /// 已完成的读次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// 已完成的写次数
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// 绕过缓存直接读取磁盘上某块的内容
    pub fn peek(&self, dev: u32, blockno: u32) -> Result<Vec<u8>> {
        let devices = self.devices.lock();
        let range = Self::range(&devices, dev, blockno)?;
        Ok(devices[&dev][range].to_vec())
    }

    /// 绕过缓存直接改写磁盘上某块的内容，`bytes` 不足一块的部分补零
    pub fn poke(&self, dev: u32, blockno: u32, bytes: &[u8]) -> Result<()> {
        let mut devices = self.devices.lock();
        let range = Self::range(&devices, dev, blockno)?;
        let block = &mut devices.get_mut(&dev).ok_or(BioError::NoDevice(dev))?[range];
        let n = bytes.len().min(BSIZE);
        block[..n].copy_from_slice(&bytes[..n]);
        block[n..].fill(0);
        Ok(())
    }

    fn range(
        devices: &BTreeMap<u32, Vec<u8>>,
        dev: u32,
        blockno: u32,
    ) -> Result<core::ops::Range<usize>> {
        let storage = devices.get(&dev).ok_or(BioError::NoDevice(dev))?;
        let nblocks = (storage.len() / BSIZE) as u32;
        if blockno >= nblocks {
            return Err(BioError::OutOfRange { dev, blockno, nblocks });
        }
        let start = blockno as usize * BSIZE;
        Ok(start..start + BSIZE)
    }
}

impl Default for RamDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool) -> Result<()> {
        let latency = self.latency_us.load(Ordering::Relaxed);
        if latency > 0 {
            thread::sleep(Duration::from_micros(latency as u64));
        }
        if self.faulty.load(Ordering::Relaxed) {
            return Err(BioError::Io { dev, blockno, reason: "injected fault" });
        }

        let mut devices = self.devices.lock();
        let range = Self::range(&devices, dev, blockno)?;
        let block = &mut devices.get_mut(&dev).ok_or(BioError::NoDevice(dev))?[range];
        if writing {
            block.copy_from_slice(&data[..]);
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            data.copy_from_slice(block);
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let disk = RamDisk::new().with_device(1, 8);
        let mut data = BufData::new();
        data[0] = 0xab;
        data[BSIZE - 1] = 0xcd;
        disk.rw(1, 3, &mut data, true).unwrap();

        let mut back = BufData::new();
        disk.rw(1, 3, &mut back, false).unwrap();
        assert_eq!(back[0], 0xab);
        assert_eq!(back[BSIZE - 1], 0xcd);
        assert_eq!(disk.reads(), 1);
        assert_eq!(disk.writes(), 1);
        assert_eq!(disk.peek(1, 3).unwrap()[0], 0xab);
    }

    #[test]
    fn poke_pads_with_zero() {
        let disk = RamDisk::new().with_device(0, 2);
        disk.poke(0, 1, &[0xff; BSIZE]).unwrap();
        disk.poke(0, 1, b"hi").unwrap();
        let block = disk.peek(0, 1).unwrap();
        assert_eq!(&block[..2], b"hi");
        assert!(block[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn bad_addresses() {
        let disk = RamDisk::new().with_device(1, 4);
        let mut data = BufData::new();
        assert_eq!(disk.rw(2, 0, &mut data, false), Err(BioError::NoDevice(2)));
        assert_eq!(
            disk.rw(1, 4, &mut data, false),
            Err(BioError::OutOfRange { dev: 1, blockno: 4, nblocks: 4 })
        );
        assert_eq!(disk.reads(), 0);
    }

    #[test]
    fn injected_fault() {
        let disk = RamDisk::new().with_device(1, 4);
        disk.set_faulty(true);
        let mut data = BufData::new();
        assert!(matches!(disk.rw(1, 0, &mut data, false), Err(BioError::Io { .. })));
        disk.set_faulty(false);
        assert!(disk.rw(1, 0, &mut data, false).is_ok());
    }
}
