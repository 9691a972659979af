use std::sync::Arc;
use std::thread;

use xv6_bcache::{bcache, binit, BcacheConfig, BioError, RamDisk, Ticks};

#[test]
fn binit_once_then_shared_everywhere() {
    let disk = Arc::new(RamDisk::new().with_device(1, 32));
    let ticks = Arc::new(Ticks::new());
    let cache = binit(BcacheConfig::default(), disk.clone(), ticks.clone()).unwrap();
    assert!(std::ptr::eq(cache, bcache()));
    assert_eq!(cache.nbuf(), xv6_bcache::consts::fs::NBUF);
    assert_eq!(cache.nbucket(), xv6_bcache::consts::fs::NBUCKET);

    assert_eq!(
        binit(BcacheConfig::default().nbuf(4), disk.clone(), ticks).unwrap_err(),
        BioError::AlreadyInitialized
    );

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            thread::spawn(move || {
                let mut buf = bcache().bread(1, t as u32).unwrap();
                buf.data_mut()[0] = t + 1;
                buf.bwrite().unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4u8 {
        assert_eq!(disk.peek(1, t as u32).unwrap()[0], t + 1);
        assert_eq!(bcache().refcnt(1, t as u32), Some(0));
    }
}
