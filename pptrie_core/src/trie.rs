//! Trie engine: lookup and the insert paths bound per concurrency level.
//!
//! Inserts are copy-on-write. A new leaf is hung off a copy of its parent
//! (fork), a compressed path is broken by a new middle node (split), and an
//! existing node gains a value by a single store on its `meta` (mark final).
//! New nodes are fully written before one store/CAS on the parent link makes
//! them reachable; superseded nodes are retired through the pool.

use crate::errors::{Error, Result};
use crate::helpers::common_prefix_len;
use crate::mem_pool::Offset;
use crate::node::{link_target, meta_value, NodeRef, NodeSpec, FROZEN_LINK, FROZEN_META};
use crate::token::TokenCore;
use crate::types::ConcurrentLevel;
use crate::Patricia;
use crossbeam_utils::Backoff;
use log::debug;
#[cfg(feature = "trace")]
use log::trace;
use metrics::counter;
use std::sync::atomic::{AtomicU32, Ordering};

pub(crate) type InsertFn = fn(&Patricia, &[u8], &[u8], &mut TokenCore) -> Result<bool>;

/// Compile-time knobs of one insert path.
pub(crate) trait Strategy {
    /// Writers race each other: freeze before copying, publish by CAS.
    const FREEZE: bool;
    /// Readers may still hold superseded nodes: retire via the lazy queue.
    const LAZY_FREE: bool;
    /// Ordering of the store that publishes a node.
    const PUBLISH: Ordering;
}

pub(crate) struct Strict;
pub(crate) struct Shared;
pub(crate) struct OneWriter;
pub(crate) struct MultiWriter;

impl Strategy for Strict {
    const FREEZE: bool = false;
    const LAZY_FREE: bool = false;
    const PUBLISH: Ordering = Ordering::Relaxed;
}

impl Strategy for Shared {
    const FREEZE: bool = false;
    const LAZY_FREE: bool = true;
    const PUBLISH: Ordering = Ordering::Relaxed;
}

impl Strategy for OneWriter {
    const FREEZE: bool = false;
    const LAZY_FREE: bool = true;
    const PUBLISH: Ordering = Ordering::Release;
}

impl Strategy for MultiWriter {
    const FREEZE: bool = true;
    const LAZY_FREE: bool = true;
    const PUBLISH: Ordering = Ordering::Release;
}

pub(crate) fn insert_fn_for(level: ConcurrentLevel) -> InsertFn {
    match level {
        ConcurrentLevel::NoWriteReadOnly => insert_readonly,
        ConcurrentLevel::SingleThreadStrict => insert::<Strict>,
        ConcurrentLevel::SingleThreadShared => insert::<Shared>,
        ConcurrentLevel::OneWriteMultiRead => insert::<OneWriter>,
        ConcurrentLevel::MultiWriteMultiRead => insert::<MultiWriter>,
    }
}

fn insert_readonly(_: &Patricia, _: &[u8], _: &[u8], _: &mut TokenCore) -> Result<bool> {
    Err(Error::ReadOnly)
}

/// The link a published node hangs from.
#[derive(Debug, Clone, Copy)]
enum Parent {
    Root,
    Child(Offset, usize),
}

/// Where a missing key goes.
#[derive(Debug)]
enum Point {
    /// Key ends exactly at a non-final node.
    MarkFinal(Offset),
    /// `key[pos]` is a label the node does not have.
    Fork { parent: Parent, node: Offset, pos: usize },
    /// Key leaves (or ends inside) the node's zpath after `cp` bytes; the
    /// zpath starts at `key[pos]`.
    Split { parent: Parent, node: Offset, pos: usize, cp: usize },
}

enum Outcome {
    Done,
    Retry,
    OutOfMemory,
}

/// Walk `key` from the root. `Err` carries the value of an existing key.
fn locate(trie: &Patricia, key: &[u8]) -> std::result::Result<Point, Offset> {
    let pool = &trie.pool;
    let mut parent = Parent::Root;
    let mut cur = link_target(trie.root.load(Ordering::Acquire));
    let mut pos = 0;
    loop {
        let node = NodeRef::new(pool, cur);
        let z = node.zpath();
        let cp = common_prefix_len(z, &key[pos..]);
        if cp < z.len() {
            return Ok(Point::Split { parent, node: cur, pos, cp });
        }
        pos += z.len();
        if pos == key.len() {
            return match node.value(Ordering::Acquire) {
                0 => Ok(Point::MarkFinal(cur)),
                v => Err(v),
            };
        }
        match node.find(key[pos]) {
            Ok(i) => {
                #[cfg(feature = "trace")]
                trace!("[LOOKUP] node={} label={:#04x} -> child {}", cur, key[pos], i);
                parent = Parent::Child(cur, i);
                cur = link_target(node.link(i).load(Ordering::Acquire));
                pos += 1;
            }
            Err(_) => return Ok(Point::Fork { parent, node: cur, pos }),
        }
    }
}

/// Value offset of `key`, 0 when absent.
pub(crate) fn lookup(trie: &Patricia, key: &[u8]) -> Offset {
    locate(trie, key).err().unwrap_or(0)
}

/// Node whose full path is exactly `prefix`.
pub(crate) fn find_state(trie: &Patricia, prefix: &[u8]) -> Option<Offset> {
    let pool = &trie.pool;
    let mut cur = link_target(trie.root.load(Ordering::Acquire));
    let mut pos = 0;
    loop {
        let node = NodeRef::new(pool, cur);
        let z = node.zpath();
        if !prefix[pos..].starts_with(z) {
            return None;
        }
        pos += z.len();
        if pos == prefix.len() {
            return Some(cur);
        }
        let i = node.find(prefix[pos]).ok()?;
        cur = link_target(node.link(i).load(Ordering::Acquire));
        pos += 1;
    }
}

/// Carve a block, running one reclamation scan before giving up.
pub(crate) fn alloc(trie: &Patricia, size: usize) -> Option<Offset> {
    if let Some(off) = trie.pool.alloc(size) {
        return Some(off);
    }
    trie.registry.gc(&trie.pool);
    let off = trie.pool.alloc(size);
    if off.is_none() {
        counter!("pptrie_alloc_failures_total").increment(1);
        debug!("[ALLOC] {} bytes do not fit in {} byte pool", size, trie.pool.capacity());
    }
    off
}

fn insert<S: Strategy>(
    trie: &Patricia,
    key: &[u8],
    val: &[u8],
    tok: &mut TokenCore,
) -> Result<bool> {
    let backoff = Backoff::new();
    let mut fresh: Option<Offset> = None;
    loop {
        let point = match locate(trie, key) {
            Ok(point) => point,
            Err(existing) => {
                if let Some(off) = fresh {
                    // a concurrent writer got there first
                    discard_value(trie, off, tok);
                }
                tok.value = existing;
                return Ok(false);
            }
        };
        let value = match fresh {
            Some(off) => off,
            None => match new_value(trie, val, tok)? {
                Some(off) => {
                    fresh = Some(off);
                    off
                }
                None => {
                    tok.value = 0;
                    return Ok(true);
                }
            },
        };
        let outcome = match point {
            Point::MarkFinal(node) => mark_final::<S>(trie, node, value),
            Point::Fork { parent, node, pos } => fork::<S>(trie, parent, node, &key[pos..], value),
            Point::Split { parent, node, pos, cp } => {
                split::<S>(trie, parent, node, &key[pos..], cp, value)
            }
        };
        match outcome {
            Outcome::Done => {
                trie.num_words.fetch_add(1, Ordering::Relaxed);
                tok.value = value;
                return Ok(true);
            }
            Outcome::Retry => backoff.snooze(),
            Outcome::OutOfMemory => {
                discard_value(trie, value, tok);
                tok.value = 0;
                return Ok(true);
            }
        }
    }
}

fn new_value(trie: &Patricia, src: &[u8], tok: &mut TokenCore) -> Result<Option<Offset>> {
    let size = trie.valsize;
    let off = if size == 0 {
        trie.null_value
    } else {
        match alloc(trie, size) {
            Some(off) => off,
            None => return Ok(None),
        }
    };
    // SAFETY: the block is private to this writer until published
    let dst = unsafe { trie.pool.slice_mut(off, size) };
    let accepted = match tok.hooks.as_mut() {
        Some(hooks) => hooks.init_value(dst, src),
        None => {
            dst.copy_from_slice(src);
            true
        }
    };
    if !accepted {
        if size != 0 {
            trie.pool.free_now(off, size);
        }
        return Err(Error::ValueRejected);
    }
    Ok(Some(off))
}

fn discard_value(trie: &Patricia, off: Offset, tok: &mut TokenCore) {
    if off == trie.null_value {
        return;
    }
    // SAFETY: never published
    let val = unsafe { trie.pool.slice_mut(off, trie.valsize) };
    if let Some(hooks) = tok.hooks.as_mut() {
        hooks.destroy_value(val);
    }
    trie.pool.free_now(off, trie.valsize);
}

fn parent_link(trie: &Patricia, parent: Parent) -> &AtomicU32 {
    match parent {
        Parent::Root => &*trie.root,
        Parent::Child(node, i) => NodeRef::new(&trie.pool, node).link(i),
    }
}

fn publish<S: Strategy>(trie: &Patricia, parent: Parent, old: Offset, new: Offset) -> bool {
    let link = parent_link(trie, parent);
    if S::FREEZE {
        // a frozen link never equals a bare offset
        link.compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    } else {
        link.store(new, S::PUBLISH);
        true
    }
}

/// Claim `node` for copying: its value and child links, which no other
/// writer can change until it is unfrozen. `None` if another writer holds it
/// or it was already superseded.
fn freeze<S: Strategy>(node: NodeRef<'_>) -> Option<(Offset, Vec<u32>)> {
    let n = node.n_children();
    if !S::FREEZE {
        let links = (0..n).map(|i| node.link(i).load(Ordering::Relaxed)).collect();
        return Some((node.value(Ordering::Relaxed), links));
    }
    let meta = node.meta().load(Ordering::Acquire);
    if meta & FROZEN_META != 0 {
        return None;
    }
    node.meta()
        .compare_exchange(meta, meta | FROZEN_META, Ordering::AcqRel, Ordering::Relaxed)
        .ok()?;
    let links = (0..n)
        .map(|i| link_target(node.link(i).fetch_or(FROZEN_LINK, Ordering::AcqRel)))
        .collect();
    Some((meta_value(meta), links))
}

fn unfreeze<S: Strategy>(node: NodeRef<'_>) {
    if S::FREEZE {
        for i in 0..node.n_children() {
            node.link(i).fetch_and(!FROZEN_LINK, Ordering::Release);
        }
        node.meta().fetch_and(!FROZEN_META, Ordering::Release);
    }
}

/// Hand a superseded node back to the pool.
fn retire<S: Strategy>(trie: &Patricia, off: Offset, size: usize) {
    if S::LAZY_FREE {
        trie.pool.free_lazy(off, size, trie.registry.free_stamp());
        if trie.pool.lazy_gc_due() {
            trie.registry.gc(&trie.pool);
        }
    } else {
        trie.pool.free_now(off, size);
    }
}

fn mark_final<S: Strategy>(trie: &Patricia, off: Offset, value: Offset) -> Outcome {
    let meta = NodeRef::new(&trie.pool, off).meta();
    if S::FREEZE {
        // fails on a frozen node as well as on a lost race
        if meta
            .compare_exchange(0, value as u64, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Outcome::Retry;
        }
    } else {
        meta.store(value as u64, S::PUBLISH);
    }
    trie.stats.n_mark_final.fetch_add(1, Ordering::Relaxed);
    Outcome::Done
}

/// `rest[0]` is the new label under `off`; the leaf takes `rest[1..]`.
fn fork<S: Strategy>(
    trie: &Patricia,
    parent: Parent,
    off: Offset,
    rest: &[u8],
    value: Offset,
) -> Outcome {
    let pool = &trie.pool;
    let node = NodeRef::new(pool, off);
    let Some((node_value, mut links)) = freeze::<S>(node) else {
        return Outcome::Retry;
    };
    let leaf = NodeSpec::leaf(value, &rest[1..]);
    let Some(leaf_off) = alloc(trie, leaf.size()) else {
        unfreeze::<S>(node);
        return Outcome::OutOfMemory;
    };
    let mut labels = node.labels().to_vec();
    let at = labels.partition_point(|&l| l < rest[0]);
    labels.insert(at, rest[0]);
    links.insert(at, leaf_off);
    let copy = NodeSpec {
        value: node_value,
        labels,
        links,
        zpath: node.zpath(),
    };
    let Some(copy_off) = alloc(trie, copy.size()) else {
        unfreeze::<S>(node);
        pool.free_now(leaf_off, leaf.size());
        return Outcome::OutOfMemory;
    };
    leaf.write(pool, leaf_off);
    copy.write(pool, copy_off);
    if !publish::<S>(trie, parent, off, copy_off) {
        unfreeze::<S>(node);
        pool.free_now(leaf_off, leaf.size());
        pool.free_now(copy_off, copy.size());
        return Outcome::Retry;
    }
    retire::<S>(trie, off, node.size());
    trie.stats.n_fork.fetch_add(1, Ordering::Relaxed);
    trie.stats.n_add_state_move.fetch_add(1, Ordering::Relaxed);
    Outcome::Done
}

/// `rest` starts where the zpath of `off` starts and diverges from it (or
/// ends) after `cp` bytes.
fn split<S: Strategy>(
    trie: &Patricia,
    parent: Parent,
    off: Offset,
    rest: &[u8],
    cp: usize,
    value: Offset,
) -> Outcome {
    let pool = &trie.pool;
    let node = NodeRef::new(pool, off);
    let Some((node_value, links)) = freeze::<S>(node) else {
        return Outcome::Retry;
    };
    let z = node.zpath();
    let moved = NodeSpec {
        value: node_value,
        labels: node.labels().to_vec(),
        links,
        zpath: &z[cp + 1..],
    };
    let mut owned: Vec<(Offset, usize)> = Vec::with_capacity(3);
    let give_up = |owned: &[(Offset, usize)]| {
        unfreeze::<S>(node);
        for &(o, size) in owned {
            pool.free_now(o, size);
        }
    };

    let Some(moved_off) = alloc(trie, moved.size()) else {
        give_up(&owned);
        return Outcome::OutOfMemory;
    };
    owned.push((moved_off, moved.size()));

    let mut leaf = None;
    let mid = if rest.len() == cp {
        NodeSpec {
            value,
            labels: vec![z[cp]],
            links: vec![moved_off],
            zpath: &z[..cp],
        }
    } else {
        let spec = NodeSpec::leaf(value, &rest[cp + 1..]);
        let Some(leaf_off) = alloc(trie, spec.size()) else {
            give_up(&owned);
            return Outcome::OutOfMemory;
        };
        owned.push((leaf_off, spec.size()));
        let (old_label, new_label) = (z[cp], rest[cp]);
        let (labels, links) = if old_label < new_label {
            (vec![old_label, new_label], vec![moved_off, leaf_off])
        } else {
            (vec![new_label, old_label], vec![leaf_off, moved_off])
        };
        leaf = Some((spec, leaf_off));
        NodeSpec {
            value: 0,
            labels,
            links,
            zpath: &z[..cp],
        }
    };
    let Some(mid_off) = alloc(trie, mid.size()) else {
        give_up(&owned);
        return Outcome::OutOfMemory;
    };
    owned.push((mid_off, mid.size()));

    moved.write(pool, moved_off);
    if let Some((spec, leaf_off)) = &leaf {
        spec.write(pool, *leaf_off);
    }
    mid.write(pool, mid_off);
    if !publish::<S>(trie, parent, off, mid_off) {
        give_up(&owned);
        return Outcome::Retry;
    }
    retire::<S>(trie, off, node.size());
    trie.stats.n_split.fetch_add(1, Ordering::Relaxed);
    trie.stats.n_add_state_move.fetch_add(1, Ordering::Relaxed);
    Outcome::Done
}
