//! 缓冲区映射桶
//!
//! 每个桶是一条以缓冲区下标串起来的单向侵入式链表。链表结构本身放在
//! [`Bucket`] 中，由桶锁保护；每个节点的 `next` 以及键、引用计数放在
//! [`BufCtrl`] 中，只能在持有该缓冲区**当前**所属桶的锁时修改。

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::consts::fs::DEV_SHIFT;

/// 空链接
const NIL: usize = usize::MAX;

/// 计算 `(dev, blockno)` 所在的桶。
#[inline]
pub fn bucket_of(dev: u32, blockno: u32, nbucket: usize) -> usize {
    (((dev as usize) << DEV_SHIFT) | blockno as usize) % nbucket
}

/// 缓冲块控制结构，记录缓冲区的键、引用计数与链表链接。
///
/// 所有字段都只在持有所属桶锁时写入，桶锁的获取/释放已经提供了
/// 必要的先后关系，因此一律使用 `Relaxed`。唯一的例外是持有引用
/// （引用计数大于 0）的一方读取键：键只在引用计数为 0 时才会改变。
pub(super) struct BufCtrl {
    /// 是否已绑定到某个键；未绑定的缓冲区不会被查找命中
    bound: AtomicBool,
    dev: AtomicU32,
    blockno: AtomicU32,
    /// 当前有多少个持有者（`bget` 或 `pin`）
    refcnt: AtomicUsize,
    /// 引用计数最近一次归零时的时钟值
    lastuse: AtomicUsize,
    /// 同一桶中的下一个缓冲区
    next: AtomicUsize,
}

impl BufCtrl {
    pub(super) const fn new() -> Self {
        Self {
            bound: AtomicBool::new(false),
            dev: AtomicU32::new(0),
            blockno: AtomicU32::new(0),
            refcnt: AtomicUsize::new(0),
            lastuse: AtomicUsize::new(0),
            next: AtomicUsize::new(NIL),
        }
    }

    #[inline]
    pub(super) fn dev(&self) -> u32 {
        self.dev.load(Ordering::Relaxed)
    }

    #[inline]
    pub(super) fn blockno(&self) -> u32 {
        self.blockno.load(Ordering::Relaxed)
    }

    #[inline]
    pub(super) fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Relaxed)
    }

    #[inline]
    pub(super) fn matches(&self, dev: u32, blockno: u32) -> bool {
        self.is_bound() && self.dev() == dev && self.blockno() == blockno
    }

    #[inline]
    pub(super) fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Relaxed)
    }

    #[inline]
    pub(super) fn set_refcnt(&self, refcnt: usize) {
        self.refcnt.store(refcnt, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn lastuse(&self) -> usize {
        self.lastuse.load(Ordering::Relaxed)
    }

    #[inline]
    pub(super) fn set_lastuse(&self, ticks: usize) {
        self.lastuse.store(ticks, Ordering::Relaxed);
    }

    /// 把缓冲区绑定到新键，并记为被调用者引用一次。
    pub(super) fn bind(&self, dev: u32, blockno: u32) {
        self.dev.store(dev, Ordering::Relaxed);
        self.blockno.store(blockno, Ordering::Relaxed);
        self.bound.store(true, Ordering::Relaxed);
        self.refcnt.store(1, Ordering::Relaxed);
    }

    #[inline]
    fn next(&self) -> Option<usize> {
        match self.next.load(Ordering::Relaxed) {
            NIL => None,
            i => Some(i),
        }
    }

    #[inline]
    fn set_next(&self, next: Option<usize>) {
        self.next.store(next.unwrap_or(NIL), Ordering::Relaxed);
    }
}

/// 一个缓冲区映射桶：链表头
///
/// 只通过桶锁的守卫访问，因此这里的方法都假定调用方持有该桶的锁。
pub(super) struct Bucket {
    head: Option<usize>,
}

impl Bucket {
    pub(super) const fn new() -> Self {
        Self { head: None }
    }

    /// 按链表顺序遍历，产出 `(前驱, 下标)`。
    pub(super) fn iter<'a>(&self, ctrls: &'a [BufCtrl]) -> BucketIter<'a> {
        BucketIter { ctrls, prev: None, cur: self.head }
    }

    /// 在桶中查找键为 `(dev, blockno)` 的缓冲区。
    pub(super) fn find(&self, ctrls: &[BufCtrl], dev: u32, blockno: u32) -> Option<usize> {
        self.iter(ctrls)
            .map(|(_, index)| index)
            .find(|&index| ctrls[index].matches(dev, blockno))
    }

    /// 把缓冲区插入到链表头部。
    pub(super) fn push_front(&mut self, ctrls: &[BufCtrl], index: usize) {
        ctrls[index].set_next(self.head);
        self.head = Some(index);
    }

    /// 把 `index` 从链表中摘除，`prev` 是遍历时得到的前驱。
    pub(super) fn unlink(&mut self, ctrls: &[BufCtrl], prev: Option<usize>, index: usize) {
        let next = ctrls[index].next();
        match prev {
            None => {
                debug_assert_eq!(self.head, Some(index));
                self.head = next;
            }
            Some(p) => {
                debug_assert_eq!(ctrls[p].next(), Some(index));
                ctrls[p].set_next(next);
            }
        }
        ctrls[index].set_next(None);
    }

    pub(super) fn len(&self, ctrls: &[BufCtrl]) -> usize {
        self.iter(ctrls).count()
    }
}

/// [`Bucket::iter`] 的迭代器
pub(super) struct BucketIter<'a> {
    ctrls: &'a [BufCtrl],
    prev: Option<usize>,
    cur: Option<usize>,
}

impl<'a> Iterator for BucketIter<'a> {
    type Item = (Option<usize>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur?;
        let item = (self.prev, cur);
        self.prev = Some(cur);
        self.cur = self.ctrls[cur].next();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctrls(n: usize) -> Vec<BufCtrl> {
        (0..n).map(|_| BufCtrl::new()).collect()
    }

    fn order(bucket: &Bucket, ctrls: &[BufCtrl]) -> Vec<usize> {
        bucket.iter(ctrls).map(|(_, i)| i).collect()
    }

    #[test]
    fn hash_spreads_blocks() {
        assert_eq!(bucket_of(0, 0, 13), 0);
        assert_eq!(bucket_of(0, 14, 13), 1);
        assert_eq!(bucket_of(1, 0, 2), 0);
        assert_eq!(bucket_of(1, 3, 2), 1);
        assert_eq!(bucket_of(1, 5, 13), ((1usize << 27) | 5) % 13);
    }

    #[test]
    fn push_front_and_unlink() {
        let c = ctrls(4);
        let mut b = Bucket::new();
        for i in 0..4 {
            b.push_front(&c, i);
        }
        assert_eq!(order(&b, &c), vec![3, 2, 1, 0]);
        assert_eq!(b.len(&c), 4);

        // 中间
        b.unlink(&c, Some(2), 1);
        assert_eq!(order(&b, &c), vec![3, 2, 0]);
        // 头部
        b.unlink(&c, None, 3);
        assert_eq!(order(&b, &c), vec![2, 0]);
        // 尾部
        b.unlink(&c, Some(2), 0);
        assert_eq!(order(&b, &c), vec![2]);
        b.unlink(&c, None, 2);
        assert!(order(&b, &c).is_empty());
    }

    #[test]
    fn iter_reports_predecessors() {
        let c = ctrls(3);
        let mut b = Bucket::new();
        b.push_front(&c, 0);
        b.push_front(&c, 1);
        b.push_front(&c, 2);
        let pairs: Vec<_> = b.iter(&c).collect();
        assert_eq!(pairs, vec![(None, 2), (Some(2), 1), (Some(1), 0)]);
    }

    #[test]
    fn find_ignores_unbound() {
        let c = ctrls(2);
        let mut b = Bucket::new();
        b.push_front(&c, 0);
        b.push_front(&c, 1);
        assert_eq!(b.find(&c, 0, 0), None);

        c[0].bind(0, 0);
        assert_eq!(b.find(&c, 0, 0), Some(0));
        assert_eq!(c[0].refcnt(), 1);
        assert_eq!(b.find(&c, 0, 1), None);
    }
}
