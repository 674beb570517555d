//! Segmented memory pool backing trie nodes and values.
//!
//! One zeroed arena is carved by a bump cursor. Freed blocks are recycled
//! through size-classed fast bins (`MAX_FAST_BIN_SIZE` and below) or the
//! huge-block side list. Blocks that a concurrent reader may still see go to
//! the lazy-free queue first and only reach the free lists once the token
//! registry's horizon has passed the stamp they were freed at.

use crate::constants::{
    ALIGN_SIZE, CACHE_LINE, FAST_BIN_COUNT, LAZY_GC_THRESHOLD, MAX_FAST_BIN_SIZE,
};
use crate::errors::Error;
use crate::helpers::align_up;
use crate::types::{ConcurrentLevel, MemStat};
use crossbeam_queue::SegQueue;
use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::CachePadded;
use dashmap::DashMap;
use log::{debug, trace};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Offset type: blocks are addressed relative to the arena base, 0 is null.
pub type Offset = u32;

/// A block waiting for the reclamation horizon to pass `stamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LazyFreeItem {
    pub stamp: u64,
    pub offset: Offset,
    pub size: u32,
}

pub(crate) struct MemPool {
    base: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    level: ConcurrentLevel,
    cursor: CachePadded<AtomicUsize>,
    fastbin: Box<[SegQueue<Offset>]>,
    fast_size: AtomicUsize,
    huge: DashMap<u32, Vec<Offset>>,
    huge_size: AtomicUsize,
    huge_cnt: AtomicUsize,
    lazy: SegQueue<LazyFreeItem>,
    /// Oldest queued block a scan popped but could not free yet.
    lazy_front: AtomicCell<Option<LazyFreeItem>>,
    /// Queue length at which writers kick the next scan.
    lazy_gc_at: AtomicUsize,
    lazy_free_sum: AtomicUsize,
    lazy_free_cnt: AtomicUsize,
}

// SAFETY: the arena is only reached through `at`/`slice` with offsets handed
// out by this pool; ownership of a block is transferred through the trie's
// atomic links and the lock-free free lists, never shared mutably.
unsafe impl Send for MemPool {}
unsafe impl Sync for MemPool {}

impl MemPool {
    pub fn new(capacity: usize, level: ConcurrentLevel) -> Result<Self, Error> {
        let layout = Layout::from_size_align(capacity.max(ALIGN_SIZE), CACHE_LINE)?;
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw)
            .ok_or_else(|| Error::ArenaAlloc(format!("{} bytes", layout.size())))?;
        debug!("[POOL] arena of {} bytes at {:p}, level={}", capacity, raw, level);
        Ok(Self {
            base,
            layout,
            capacity,
            level,
            // offset 0 is reserved as null
            cursor: CachePadded::new(AtomicUsize::new(ALIGN_SIZE)),
            fastbin: (0..FAST_BIN_COUNT).map(|_| SegQueue::new()).collect(),
            fast_size: AtomicUsize::new(0),
            huge: DashMap::new(),
            huge_size: AtomicUsize::new(0),
            huge_cnt: AtomicUsize::new(0),
            lazy: SegQueue::new(),
            lazy_front: AtomicCell::new(None),
            lazy_gc_at: AtomicUsize::new(LAZY_GC_THRESHOLD),
            lazy_free_sum: AtomicUsize::new(0),
            lazy_free_cnt: AtomicUsize::new(0),
        })
    }

    #[inline(always)]
    pub const fn align_size(&self) -> usize {
        ALIGN_SIZE
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn round(size: usize) -> usize {
        align_up(size.max(ALIGN_SIZE), ALIGN_SIZE)
    }

    #[inline(always)]
    fn bin_of(size: usize) -> usize {
        size / ALIGN_SIZE - 1
    }

    /// Raw address of `off`; the caller must own or be reading a live block.
    #[inline(always)]
    pub fn at(&self, off: Offset) -> *mut u8 {
        debug_assert!(off != 0 && (off as usize) < self.capacity);
        // SAFETY: off < capacity, inside the arena allocation
        unsafe { self.base.as_ptr().add(off as usize) }
    }

    /// # Safety
    /// `off..off+len` must lie inside a block that is not concurrently written.
    #[inline(always)]
    pub unsafe fn slice(&self, off: Offset, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.at(off), len)
    }

    /// # Safety
    /// The caller must exclusively own the block (not yet published, or no
    /// reader can observe the bytes being written).
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, off: Offset, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.at(off), len)
    }

    /// Returns an aligned block of at least `size` bytes, or `None` when the
    /// budget is exhausted. Contents are unspecified.
    pub fn alloc(&self, size: usize) -> Option<Offset> {
        let size = Self::round(size);
        if size <= MAX_FAST_BIN_SIZE {
            if let Some(off) = self.fastbin[Self::bin_of(size)].pop() {
                self.fast_size.fetch_sub(size, Ordering::Relaxed);
                trace!("[ALLOC] fastbin hit size={} off={}", size, off);
                return Some(off);
            }
        } else if let Some(off) = self.pop_huge(size) {
            trace!("[ALLOC] huge hit size={} off={}", size, off);
            return Some(off);
        }
        self.bump(size)
    }

    fn pop_huge(&self, size: usize) -> Option<Offset> {
        let off = self.huge.get_mut(&(size as u32)).and_then(|mut list| list.pop())?;
        self.huge_size.fetch_sub(size, Ordering::Relaxed);
        self.huge_cnt.fetch_sub(1, Ordering::Relaxed);
        Some(off)
    }

    fn bump(&self, size: usize) -> Option<Offset> {
        if self.level.is_concurrent() {
            let mut cur = self.cursor.load(Ordering::Relaxed);
            loop {
                if cur + size > self.capacity {
                    return None;
                }
                match self.cursor.compare_exchange_weak(
                    cur,
                    cur + size,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(cur as Offset),
                    Err(actual) => cur = actual,
                }
            }
        } else {
            let cur = self.cursor.load(Ordering::Relaxed);
            if cur + size > self.capacity {
                return None;
            }
            self.cursor.store(cur + size, Ordering::Relaxed);
            Some(cur as Offset)
        }
    }

    /// Return a block no reader can reach straight to the free lists.
    pub fn free_now(&self, off: Offset, size: usize) {
        let size = Self::round(size);
        if size <= MAX_FAST_BIN_SIZE {
            self.fastbin[Self::bin_of(size)].push(off);
            self.fast_size.fetch_add(size, Ordering::Relaxed);
        } else {
            self.huge.entry(size as u32).or_default().push(off);
            self.huge_size.fetch_add(size, Ordering::Relaxed);
            self.huge_cnt.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Defer a block until the horizon passes `stamp`.
    pub fn free_lazy(&self, off: Offset, size: usize, stamp: u64) {
        let size = Self::round(size);
        self.lazy.push(LazyFreeItem {
            stamp,
            offset: off,
            size: size as u32,
        });
        self.lazy_free_sum.fetch_add(size, Ordering::Relaxed);
        self.lazy_free_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lazy_free_cnt(&self) -> usize {
        self.lazy_free_cnt.load(Ordering::Relaxed)
    }

    /// Enough blocks queued since the last scan to be worth another one.
    #[inline]
    pub fn lazy_gc_due(&self) -> bool {
        self.lazy_free_cnt() >= self.lazy_gc_at.load(Ordering::Relaxed)
    }

    /// Move lazily freed blocks whose stamp is below `horizon` to the free
    /// lists, oldest first. Returns the number of blocks reclaimed.
    ///
    /// Must not run concurrently with itself (the registry scan is
    /// single-flight).
    pub fn reclaim(&self, horizon: u64) -> usize {
        let pending = self.lazy_free_cnt();
        let mut freed = 0;
        while freed < pending {
            let Some(item) = self.lazy_front.take().or_else(|| self.lazy.pop()) else {
                break;
            };
            if item.stamp >= horizon {
                // queued in stamp order: everything behind it is younger
                self.lazy_front.store(Some(item));
                break;
            }
            self.lazy_free_sum.fetch_sub(item.size as usize, Ordering::Relaxed);
            self.lazy_free_cnt.fetch_sub(1, Ordering::Relaxed);
            self.free_now(item.offset, item.size as usize);
            freed += 1;
        }
        // a pinned horizon leaves the queue growing; back off geometrically
        let left = self.lazy_free_cnt();
        self.lazy_gc_at
            .store((left * 2).max(LAZY_GC_THRESHOLD), Ordering::Relaxed);
        if freed > 0 {
            trace!("[POOL] reclaimed {} blocks below horizon {}", freed, horizon);
        }
        freed
    }

    pub fn frag_size(&self) -> usize {
        self.fast_size.load(Ordering::Relaxed) + self.huge_size.load(Ordering::Relaxed)
    }

    pub fn get_stat(&self, st: &mut MemStat) {
        st.fastbin.clear();
        st.fastbin.extend(self.fastbin.iter().map(|q| q.len()));
        st.capacity = self.capacity;
        st.huge_size = self.huge_size.load(Ordering::Relaxed);
        st.huge_cnt = self.huge_cnt.load(Ordering::Relaxed);
        st.frag_size = self.fast_size.load(Ordering::Relaxed) + st.huge_size;
        st.lazy_free_sum = self.lazy_free_sum.load(Ordering::Relaxed);
        st.lazy_free_cnt = self.lazy_free_cnt.load(Ordering::Relaxed);
        let carved = self
            .cursor
            .load(Ordering::Relaxed)
            .min(self.capacity)
            .saturating_sub(ALIGN_SIZE);
        // counters move independently under concurrency; clamp so that
        // used + frag never exceeds what was carved
        st.frag_size = st.frag_size.min(carved);
        st.used_size = carved
            .saturating_sub(st.frag_size)
            .saturating_sub(st.lazy_free_sum);
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}
