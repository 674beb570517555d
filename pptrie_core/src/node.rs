//! Trie node layout inside pool blocks.
//!
//! ```text
//! +---------------------+------------------+----------------------+-----------+
//! | meta u64 | n u16 |  | labels [u8; n]   | links [u32; n]       | zpath     |
//! | pad u16 | zlen u32  | (padded to 4)    | (offset | FROZEN)    | [u8;zlen] |
//! +---------------------+------------------+----------------------+-----------+
//! ```
//!
//! Everything except `meta` and the links is written once before the node is
//! published and never touched again. `meta` carries the value offset (0 for
//! a non-final node) plus a FROZEN bit owned by a writer about to supersede
//! the node.

use crate::helpers::align_up;
use crate::mem_pool::{MemPool, Offset};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[repr(C)]
pub(crate) struct NodeHeader {
    pub meta: AtomicU64,
    pub n_children: u16,
    pub _pad: u16,
    pub zlen: u32,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<NodeHeader>();
const _: () = assert!(HEADER_SIZE == 16);

pub(crate) const FROZEN_META: u64 = 1 << 63;
pub(crate) const FROZEN_LINK: u32 = 1 << 31;
pub(crate) const VALUE_MASK: u64 = 0xFFFF_FFFF;

#[inline(always)]
pub(crate) fn meta_value(meta: u64) -> Offset {
    (meta & VALUE_MASK) as Offset
}

#[inline(always)]
pub(crate) fn link_target(link: u32) -> Offset {
    link & !FROZEN_LINK
}

#[inline(always)]
fn links_at(n: usize) -> usize {
    HEADER_SIZE + align_up(n, 4)
}

#[inline(always)]
pub(crate) fn node_size(n: usize, zlen: usize) -> usize {
    align_up(links_at(n) + 4 * n + zlen, 8)
}

/// Borrowed view of a published (or exclusively owned) node.
#[derive(Clone, Copy)]
pub(crate) struct NodeRef<'a> {
    pool: &'a MemPool,
    pub off: Offset,
}

impl<'a> NodeRef<'a> {
    #[inline(always)]
    pub fn new(pool: &'a MemPool, off: Offset) -> Self {
        debug_assert!(off != 0 && off & FROZEN_LINK == 0);
        Self { pool, off }
    }

    #[inline(always)]
    fn header(&self) -> &'a NodeHeader {
        // SAFETY: off addresses a node block, aligned to 8
        unsafe { &*(self.pool.at(self.off) as *const NodeHeader) }
    }

    #[inline(always)]
    pub fn meta(&self) -> &'a AtomicU64 {
        &self.header().meta
    }

    #[inline(always)]
    pub fn n_children(&self) -> usize {
        self.header().n_children as usize
    }

    #[inline(always)]
    pub fn zlen(&self) -> usize {
        self.header().zlen as usize
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        node_size(self.n_children(), self.zlen())
    }

    #[inline(always)]
    pub fn labels(&self) -> &'a [u8] {
        // SAFETY: labels are immutable once the node is published
        unsafe {
            std::slice::from_raw_parts(self.pool.at(self.off).add(HEADER_SIZE), self.n_children())
        }
    }

    #[inline(always)]
    pub fn link(&self, i: usize) -> &'a AtomicU32 {
        debug_assert!(i < self.n_children());
        // SAFETY: link i lies inside the block, 4-aligned
        unsafe {
            &*(self.pool.at(self.off).add(links_at(self.n_children()) + 4 * i) as *const AtomicU32)
        }
    }

    #[inline(always)]
    pub fn zpath(&self) -> &'a [u8] {
        let n = self.n_children();
        // SAFETY: zpath is immutable once the node is published
        unsafe {
            std::slice::from_raw_parts(
                self.pool.at(self.off).add(links_at(n) + 4 * n),
                self.zlen(),
            )
        }
    }

    /// Position of `label` among the sorted child labels.
    #[inline]
    pub fn find(&self, label: u8) -> Result<usize, usize> {
        self.labels().binary_search(&label)
    }

    #[inline]
    pub fn value(&self, order: Ordering) -> Offset {
        meta_value(self.meta().load(order))
    }
}

/// Everything needed to materialise a node in a freshly allocated block.
pub(crate) struct NodeSpec<'k> {
    pub value: Offset,
    pub labels: Vec<u8>,
    pub links: Vec<u32>,
    pub zpath: &'k [u8],
}

impl<'k> NodeSpec<'k> {
    pub fn leaf(value: Offset, zpath: &'k [u8]) -> Self {
        Self {
            value,
            labels: Vec::new(),
            links: Vec::new(),
            zpath,
        }
    }

    pub fn size(&self) -> usize {
        node_size(self.labels.len(), self.zpath.len())
    }

    /// Writes the node into `off`, which must be an exclusively owned block
    /// of at least `self.size()` bytes.
    pub fn write(&self, pool: &MemPool, off: Offset) {
        debug_assert_eq!(self.labels.len(), self.links.len());
        debug_assert!(self.labels.windows(2).all(|w| w[0] < w[1]));
        let n = self.labels.len();
        let base = pool.at(off);
        // SAFETY: the block is private to this writer until published
        unsafe {
            std::ptr::write(
                base as *mut NodeHeader,
                NodeHeader {
                    meta: AtomicU64::new(self.value as u64),
                    n_children: n as u16,
                    _pad: 0,
                    zlen: self.zpath.len() as u32,
                },
            );
            std::ptr::copy_nonoverlapping(self.labels.as_ptr(), base.add(HEADER_SIZE), n);
            let links = base.add(links_at(n)) as *mut AtomicU32;
            for (i, &l) in self.links.iter().enumerate() {
                std::ptr::write(links.add(i), AtomicU32::new(link_target(l)));
            }
            std::ptr::copy_nonoverlapping(
                self.zpath.as_ptr(),
                base.add(links_at(n) + 4 * n),
                self.zpath.len(),
            );
        }
    }
}
