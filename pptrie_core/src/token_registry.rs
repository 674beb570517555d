//! Token registry: every live token of one trie, in version order.
//!
//! Token records live in an arena of lazily created segments and are
//! addressed by 20-bit slot indices. Linked tokens form a singly linked list
//! whose head is one atomic word packing `(head slot, latest stamp)`, so
//! acquiring a token mints its stamp and makes it visible to reclamation
//! scans in a single CAS. The list is strictly descending in `verseq`.
//!
//! Only the head word is written by acquiring threads. Interior `next`
//! links are rewritten exclusively by the (single-flight) reclamation scan,
//! which unlinks released and disposed tokens and computes the horizon: the
//! smallest stamp any in-flight operation can still be reading under.

use crate::constants::{FIRST_SEGMENT_SLOTS, NIL_SLOT, TOKEN_SEGMENTS};
use crate::errors::Error;
use crate::helpers::{pack, unpack};
use crate::mem_pool::MemPool;
use crate::types::{ConcurrentLevel, TokenFlags, TokenKind, TokenState, IS_HEAD_BIT};
use crossbeam_queue::SegQueue;
use crossbeam_utils::{Backoff, CachePadded};
use log::{debug, trace, warn};
use metrics::counter;
use once_cell::sync::OnceCell;
use std::sync::atomic::{fence, AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Slot index of a token inside the registry arena.
pub type SlotId = u32;

const MAX_SLOTS: u32 = (FIRST_SEGMENT_SLOTS as u32) * ((1 << TOKEN_SEGMENTS) - 1);
const _: () = assert!(MAX_SLOTS < NIL_SLOT);

const STAMP_ONE: u64 = 1 << crate::constants::SLOT_BITS;

/// Synchronised half of a token; the owner keeps the rest.
#[derive(Debug)]
pub(crate) struct TokenSlot {
    pub next: AtomicU32,
    pub verseq: AtomicU64,
    pub min_age: AtomicU64,
    pub flags: AtomicU16,
    pub kind: AtomicU8,
    pub cpu: AtomicU32,
    pub thread_id: AtomicU64,
}

impl TokenSlot {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(NIL_SLOT),
            verseq: AtomicU64::new(0),
            min_age: AtomicU64::new(0),
            flags: AtomicU16::new(TokenFlags::new(TokenState::ReleaseDone, false).to_bits()),
            kind: AtomicU8::new(TokenKind::Reader as u8),
            cpu: AtomicU32::new(0),
            thread_id: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn flags(&self) -> TokenFlags {
        TokenFlags::from_bits(self.flags.load(Ordering::Acquire))
    }
}

pub(crate) struct TokenRegistry {
    level: ConcurrentLevel,
    segments: Box<[OnceCell<Box<[TokenSlot]>>]>,
    next_fresh: AtomicU32,
    free_slots: SegQueue<SlotId>,
    head: CachePadded<AtomicU64>,
    min_age: CachePadded<AtomicU64>,
    scanning: AtomicBool,
    /// Set by callers that found a scan running; the running scan goes again.
    rescan: AtomicBool,
    scans: AtomicU64,
}

#[inline]
fn locate(idx: SlotId) -> (usize, usize) {
    let q = idx as usize / FIRST_SEGMENT_SLOTS + 1;
    let seg = (usize::BITS - 1 - q.leading_zeros()) as usize;
    let start = FIRST_SEGMENT_SLOTS * ((1 << seg) - 1);
    (seg, idx as usize - start)
}

impl TokenRegistry {
    pub fn new(level: ConcurrentLevel) -> Self {
        Self {
            level,
            segments: (0..TOKEN_SEGMENTS).map(|_| OnceCell::new()).collect(),
            next_fresh: AtomicU32::new(0),
            free_slots: SegQueue::new(),
            head: CachePadded::new(AtomicU64::new(pack(NIL_SLOT, 0))),
            min_age: CachePadded::new(AtomicU64::new(1)),
            scanning: AtomicBool::new(false),
            rescan: AtomicBool::new(false),
            scans: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn slot(&self, idx: SlotId) -> &TokenSlot {
        let (seg, off) = locate(idx);
        let segment = self.segments[seg].get_or_init(|| {
            (0..FIRST_SEGMENT_SLOTS << seg).map(|_| TokenSlot::new()).collect()
        });
        &segment[off]
    }

    /// Reserve a slot for a new token (state `ReleaseDone`, unlinked).
    pub fn register(&self, kind: TokenKind, thread_id: u64, cpu: u32) -> Result<SlotId, Error> {
        let idx = match self.free_slots.pop() {
            Some(idx) => idx,
            None => self
                .next_fresh
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    (n < MAX_SLOTS).then_some(n + 1)
                })
                .map_err(|_| {
                    warn!("[TOKEN] all {} token slots in use", MAX_SLOTS);
                    Error::TokenSlotsExhausted
                })?,
        };
        let slot = self.slot(idx);
        slot.next.store(NIL_SLOT, Ordering::Relaxed);
        slot.kind.store(kind as u8, Ordering::Relaxed);
        slot.thread_id.store(thread_id, Ordering::Relaxed);
        slot.cpu.store(cpu, Ordering::Relaxed);
        slot.flags.store(
            TokenFlags::new(TokenState::ReleaseDone, false).to_bits(),
            Ordering::Release,
        );
        trace!("[TOKEN] registered slot={} kind={:?}", idx, kind);
        Ok(idx)
    }

    fn unregister(&self, idx: SlotId) {
        trace!("[TOKEN] slot={} recycled", idx);
        self.free_slots.push(idx);
    }

    /// Latest stamp handed out, read after a full fence. Blocks freed now are
    /// tagged with it.
    #[inline]
    pub fn free_stamp(&self) -> u64 {
        fence(Ordering::SeqCst);
        unpack(self.head.load(Ordering::SeqCst)).1
    }

    /// Last published reclamation horizon.
    #[inline]
    pub fn min_age(&self) -> u64 {
        self.min_age.load(Ordering::Acquire)
    }

    /// Stamp `idx` and, when `linked`, push it onto the list; returns the
    /// stamp. Unlinked tokens never hold back reclamation.
    pub fn acquire(&self, idx: SlotId, linked: bool) -> u64 {
        let slot = self.slot(idx);
        debug_assert_eq!(
            slot.flags().state,
            TokenState::ReleaseDone,
            "acquire of a token that is not released"
        );
        debug_assert!(!linked || self.level.tracks_tokens());
        let stamp = if !linked {
            let stamp = unpack(self.head.fetch_add(STAMP_ONE, Ordering::Relaxed)).1 + 1;
            slot.verseq.store(stamp, Ordering::Relaxed);
            slot.flags.store(
                TokenFlags::new(TokenState::AcquireDone, false).to_bits(),
                Ordering::Relaxed,
            );
            stamp
        } else {
            let acquired = TokenFlags::new(TokenState::AcquireDone, true).to_bits();
            let (old_head, stamp) = if self.level.is_concurrent() {
                let backoff = Backoff::new();
                loop {
                    let word = self.head.load(Ordering::Acquire);
                    let (hidx, hstamp) = unpack(word);
                    slot.next.store(hidx, Ordering::Relaxed);
                    slot.verseq.store(hstamp + 1, Ordering::Relaxed);
                    slot.flags.store(acquired, Ordering::Relaxed);
                    if self
                        .head
                        .compare_exchange(word, pack(idx, hstamp + 1), Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                    {
                        break (hidx, hstamp + 1);
                    }
                    backoff.spin();
                }
            } else {
                let (hidx, hstamp) = unpack(self.head.load(Ordering::Relaxed));
                slot.next.store(hidx, Ordering::Relaxed);
                slot.verseq.store(hstamp + 1, Ordering::Relaxed);
                slot.flags.store(acquired, Ordering::Relaxed);
                self.head.store(pack(idx, hstamp + 1), Ordering::Relaxed);
                (hidx, hstamp + 1)
            };
            // the head word moved off `old_head`, so we own clearing its flag
            if old_head != NIL_SLOT {
                self.slot(old_head).flags.fetch_and(!IS_HEAD_BIT, Ordering::AcqRel);
            }
            // reads of the trie must not float above the link
            fence(Ordering::SeqCst);
            stamp
        };
        slot.min_age.store(self.min_age(), Ordering::Relaxed);
        stamp
    }

    /// Mark `idx` released and try to unlink it right away.
    pub fn release(&self, idx: SlotId, pool: &MemPool, linked: bool) {
        let slot = self.slot(idx);
        if !linked {
            debug_assert_eq!(slot.flags().state, TokenState::AcquireDone);
            slot.flags.store(
                TokenFlags::new(TokenState::ReleaseDone, false).to_bits(),
                Ordering::Release,
            );
            return;
        }
        let prev = slot.flags.fetch_update(Ordering::Release, Ordering::Relaxed, |bits| {
            let f = TokenFlags::from_bits(bits);
            (f.state == TokenState::AcquireDone)
                .then(|| TokenFlags::new(TokenState::ReleaseWait, f.is_head).to_bits())
        });
        debug_assert!(prev.is_ok(), "release of a token that is not acquired");
        self.gc(pool);
    }

    /// Block until a released slot has been unlinked so it can be re-acquired.
    pub fn wait_released(&self, idx: SlotId, pool: &MemPool) {
        let slot = self.slot(idx);
        let backoff = Backoff::new();
        while slot.flags().state == TokenState::ReleaseWait {
            self.gc(pool);
            backoff.snooze();
        }
    }

    /// Give a released slot back. Destroys it now when unlinked, otherwise
    /// parks it at `DisposeWait` for the next scan.
    pub fn dispose(&self, idx: SlotId, pool: &MemPool) {
        let slot = self.slot(idx);
        if !self.level.tracks_tokens() {
            slot.flags.store(
                TokenFlags::new(TokenState::DisposeDone, false).to_bits(),
                Ordering::Release,
            );
            self.unregister(idx);
            return;
        }
        loop {
            let bits = slot.flags.load(Ordering::Acquire);
            let f = TokenFlags::from_bits(bits);
            let next = match f.state {
                TokenState::AcquireDone => {
                    debug_assert!(false, "dispose of an acquired token");
                    return;
                }
                TokenState::ReleaseDone => TokenFlags::new(TokenState::DisposeDone, false),
                TokenState::ReleaseWait => TokenFlags::new(TokenState::DisposeWait, f.is_head),
                TokenState::DisposeWait | TokenState::DisposeDone => {
                    debug_assert!(false, "token disposed twice");
                    return;
                }
            };
            if slot
                .flags
                .compare_exchange(bits, next.to_bits(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // a scan moved us from ReleaseWait to ReleaseDone
                continue;
            }
            if next.state == TokenState::DisposeDone {
                self.unregister(idx);
            } else {
                trace!("[TOKEN] slot={} dispose deferred", idx);
                self.gc(pool);
            }
            return;
        }
    }

    /// Reclamation scan. Unlinks waiting tokens, recomputes the horizon and
    /// hands it to the pool. Returns `false` if another scan was running; that
    /// scan then repeats itself before it lets go, so the request is not lost.
    pub fn gc(&self, pool: &MemPool) -> bool {
        if !self.level.tracks_tokens() {
            return false;
        }
        self.rescan.store(true, Ordering::SeqCst);
        if !self.try_lock_scan() {
            return false;
        }
        loop {
            self.rescan.store(false, Ordering::SeqCst);
            self.scan(pool);
            if !self.unlock_scan() {
                return true;
            }
        }
    }

    /// Completed scans since creation.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    fn try_lock_scan(&self) -> bool {
        self.scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    // Drop the scan lock. `true` when a scan was requested meanwhile and the
    // lock was taken again for it.
    fn unlock_scan(&self) -> bool {
        self.scanning.store(false, Ordering::SeqCst);
        self.rescan.load(Ordering::SeqCst) && self.try_lock_scan()
    }

    // One pass over the list; the caller holds the scan lock.
    fn scan(&self, pool: &MemPool) {
        fence(Ordering::SeqCst);
        let (head_idx, head_stamp) = unpack(self.head.load(Ordering::SeqCst));
        let mut horizon = head_stamp + 1;
        let mut prev = NIL_SLOT;
        let mut cur = head_idx;
        let mut unlinked = 0usize;
        while cur != NIL_SLOT {
            let slot = self.slot(cur);
            let next = slot.next.load(Ordering::Acquire);
            let f = slot.flags();
            let removable = matches!(f.state, TokenState::ReleaseWait | TokenState::DisposeWait);
            if f.state == TokenState::AcquireDone {
                horizon = horizon.min(slot.verseq.load(Ordering::Relaxed));
            }
            if removable && self.unlink(prev, cur, next, f.is_head) {
                trace!(
                    "[GC] unlink slot={} kind={} thread={} cpu={}",
                    cur,
                    slot.kind.load(Ordering::Relaxed),
                    slot.thread_id.load(Ordering::Relaxed),
                    slot.cpu.load(Ordering::Relaxed)
                );
                self.finish_unlink(cur);
                unlinked += 1;
            } else {
                prev = cur;
            }
            cur = next;
        }
        self.min_age.fetch_max(horizon, Ordering::AcqRel);

        // publish the watermark to every token still linked
        let mut cur = unpack(self.head.load(Ordering::Acquire)).0;
        while cur != NIL_SLOT {
            let slot = self.slot(cur);
            slot.min_age.store(horizon, Ordering::Relaxed);
            cur = slot.next.load(Ordering::Acquire);
        }

        let reclaimed = pool.reclaim(horizon);
        self.scans.fetch_add(1, Ordering::Relaxed);
        counter!("pptrie_gc_runs_total").increment(1);
        debug!(
            "[GC] horizon={} unlinked={} reclaimed={} pending={}",
            horizon,
            unlinked,
            reclaimed,
            pool.lazy_free_cnt()
        );
    }

    // Splice `cur` out. The head goes through a CAS on the head word; an
    // interior slot is skipped while a pusher still owes it an is_head clear.
    fn unlink(&self, prev: SlotId, cur: SlotId, next: SlotId, is_head: bool) -> bool {
        if prev == NIL_SLOT {
            let word = self.head.load(Ordering::Acquire);
            let (hidx, hstamp) = unpack(word);
            if hidx != cur {
                // new tokens were pushed above us; their links are not ours to touch
                return false;
            }
            self.head
                .compare_exchange(word, pack(next, hstamp), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        } else {
            if is_head {
                return false;
            }
            self.slot(prev).next.store(next, Ordering::Release);
            true
        }
    }

    fn finish_unlink(&self, idx: SlotId) {
        let slot = self.slot(idx);
        loop {
            let bits = slot.flags.load(Ordering::Acquire);
            let f = TokenFlags::from_bits(bits);
            let done = match f.state {
                TokenState::ReleaseWait => TokenState::ReleaseDone,
                TokenState::DisposeWait => TokenState::DisposeDone,
                other => {
                    debug_assert!(false, "unlinked slot in state {:?}", other);
                    return;
                }
            };
            // the owner may concurrently turn ReleaseWait into DisposeWait
            if slot
                .flags
                .compare_exchange(
                    bits,
                    TokenFlags::new(done, false).to_bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                slot.next.store(NIL_SLOT, Ordering::Relaxed);
                if done == TokenState::DisposeDone {
                    self.unregister(idx);
                }
                return;
            }
        }
    }

    #[cfg(test)]
    pub fn linked_count(&self) -> usize {
        let mut n = 0;
        let mut cur = unpack(self.head.load(Ordering::Acquire)).0;
        while cur != NIL_SLOT {
            n += 1;
            cur = self.slot(cur).next.load(Ordering::Acquire);
        }
        n
    }
}
