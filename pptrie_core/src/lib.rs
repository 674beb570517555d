pub mod constants;
pub mod errors;
pub mod helpers;
pub mod iter;
pub(crate) mod mem_pool;
pub(crate) mod node;
pub mod platform;
pub mod telemetry;
pub mod token;
pub(crate) mod token_registry;
pub(crate) mod trie;
pub mod types;

pub use errors::{Error, Result};
pub use iter::{IteratorPtr, LexIterator, PatriciaIter};
pub use token::{
    CopyValue, PlainValue, ReaderToken, ReaderTokenPtr, Token, TokenBase, ValueHooks,
    WriterToken, WriterTokenPtr,
};
pub use types::{ConcurrentLevel, MemStat, Stat, StateId, TokenKind, TokenState};

use constants::{ALIGN_SIZE, DEFAULT_MAX_MEM, MAX_ARENA_BYTES};
use crossbeam_utils::CachePadded;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use mem_pool::{MemPool, Offset};
use metrics::{counter, gauge};
use node::{node_size, NodeSpec};
use once_cell::sync::OnceCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use token::TokenCore;
use token_registry::TokenRegistry;
use trie::InsertFn;
use types::AtomicStat;

static NEXT_TRIE_ID: AtomicU64 = AtomicU64::new(1);

/// Concurrent Patricia trie mapping byte strings to fixed-size values.
///
/// Readers and writers enter through tokens ([`ReaderToken`],
/// [`WriterToken`], [`PatriciaIter`]). Nodes superseded by an insert are
/// only reused once no token acquired before the supersession is still
/// acquired, so lookups never block and never see a reused block.
pub struct Patricia {
    pub(crate) pool: MemPool,
    pub(crate) registry: TokenRegistry,
    pub(crate) root: CachePadded<AtomicU32>,
    pub(crate) valsize: usize,
    pub(crate) level: ConcurrentLevel,
    /// Shared value block of a `valsize == 0` trie, 0 otherwise.
    pub(crate) null_value: Offset,
    readonly: AtomicBool,
    insert_fn: InsertFn,
    pub(crate) stats: AtomicStat,
    pub(crate) num_words: AtomicUsize,
    /// Process-unique tag carried by every `StateId` of this trie.
    id: u64,
    tls_readers: DashMap<u64, TokenCore>,
    tls_writers: DashMap<u64, TokenCore>,
}

impl Patricia {
    // ---- logging bootstrapper ------------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    /// New trie storing `valsize`-byte values inside a `max_mem`-byte pool.
    ///
    /// `max_mem` is rounded down to the allocation alignment and capped at
    /// what 31-bit node links can address.
    pub fn create(valsize: usize, max_mem: usize, level: ConcurrentLevel) -> Result<Self> {
        Self::ensure_logging();
        telemetry::init();
        let capacity = max_mem.min(MAX_ARENA_BYTES) & !(ALIGN_SIZE - 1);
        let pool = MemPool::new(capacity, level)?;

        let root = pool.alloc(node_size(0, 0)).ok_or(Error::ZeroCapacity)?;
        NodeSpec::leaf(0, &[]).write(&pool, root);
        let null_value = match valsize {
            0 => pool.alloc(ALIGN_SIZE).ok_or(Error::ZeroCapacity)?,
            _ => 0,
        };

        info!(
            "[CREATE] valsize={} max_mem={} level={}",
            valsize, capacity, level
        );
        Ok(Self {
            pool,
            registry: TokenRegistry::new(level),
            root: CachePadded::new(AtomicU32::new(root)),
            valsize,
            level,
            null_value,
            readonly: AtomicBool::new(level == ConcurrentLevel::NoWriteReadOnly),
            insert_fn: trie::insert_fn_for(level),
            stats: AtomicStat::default(),
            num_words: AtomicUsize::new(0),
            id: NEXT_TRIE_ID.fetch_add(1, Ordering::Relaxed),
            tls_readers: DashMap::new(),
            tls_writers: DashMap::new(),
        })
    }

    /// 512 KiB pool, `OneWriteMultiRead`.
    pub fn with_defaults(valsize: usize) -> Result<Self> {
        Self::create(valsize, DEFAULT_MAX_MEM, ConcurrentLevel::default())
    }

    /// Insert `key` with a copy of `value`.
    ///
    /// * `Ok(true)` and `token.value().is_some()`: inserted.
    /// * `Ok(true)` and `token.value().is_none()`: key absent but the pool is
    ///   exhausted; the trie is unchanged.
    /// * `Ok(false)`: key already present; `token.value()` is the stored value.
    pub fn insert(&self, key: &[u8], value: &[u8], token: &mut WriterToken<'_>) -> Result<bool> {
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        if value.len() != self.valsize {
            return Err(Error::ValueSize {
                expected: self.valsize,
                got: value.len(),
            });
        }
        debug_assert!(std::ptr::eq(token.trie(), self), "token of another trie");
        debug_assert!(token.is_acquired(), "insert with a released token");
        counter!("pptrie_inserts_total").increment(1);
        (self.insert_fn)(self, key, value, &mut token.base.core)
    }

    /// `true` iff `key` is present; the token's value is set accordingly.
    pub fn lookup(&self, key: &[u8], token: &mut ReaderToken<'_>) -> bool {
        debug_assert!(std::ptr::eq(token.trie(), self), "token of another trie");
        debug_assert!(token.is_acquired(), "lookup with a released token");
        counter!("pptrie_lookups_total").increment(1);
        let value = trie::lookup(self, key);
        token.base.core.value = value;
        value != 0
    }

    /// Freeze the trie. Irreversible; later inserts fail with
    /// [`Error::ReadOnly`] and later readers skip registry linking.
    pub fn set_readonly(&self) {
        if !self.readonly.swap(true, Ordering::AcqRel) {
            info!("[READONLY] words={}", self.num_words());
        }
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Acquire)
    }

    /// Run a reclamation scan now. `false` if one was already running.
    pub fn gc(&self) -> bool {
        self.registry.gc(&self.pool)
    }

    /// Reclamation scans completed so far.
    pub fn gc_runs(&self) -> u64 {
        self.registry.scans()
    }

    /// Last published reclamation horizon.
    pub fn min_age(&self) -> u64 {
        self.registry.min_age()
    }

    #[inline]
    pub fn mem_align_size(&self) -> usize {
        self.pool.align_size()
    }

    pub fn mem_frag_size(&self) -> usize {
        self.pool.frag_size()
    }

    pub fn mem_get_stat_into(&self, st: &mut MemStat) {
        self.pool.get_stat(st);
    }

    pub fn mem_get_stat(&self) -> MemStat {
        let mut st = MemStat::default();
        self.pool.get_stat(&mut st);
        st
    }

    pub fn trie_stat(&self) -> Stat {
        self.stats.snapshot()
    }

    pub fn num_words(&self) -> usize {
        self.num_words.load(Ordering::Relaxed)
    }

    pub fn get_valsize(&self) -> usize {
        self.valsize
    }

    pub fn concurrent_level(&self) -> ConcurrentLevel {
        self.level
    }

    /// The root state; always denotes the current root node.
    pub fn initial_state(&self) -> StateId {
        StateId { node: 0, trie: self.id }
    }

    /// State reached by exactly `prefix`, if the trie has a node there.
    ///
    /// A non-root state names a node, which an insert may supersede and the
    /// pool then reuse. It is therefore only handed out once the trie is
    /// readonly; a writable trie answers `None` for every non-empty prefix.
    pub fn state_of(&self, prefix: &[u8], token: &ReaderToken<'_>) -> Option<StateId> {
        debug_assert!(token.is_acquired(), "state_of with a released token");
        if prefix.is_empty() {
            return Some(self.initial_state());
        }
        if !self.is_readonly() {
            debug!("[STATE] non-root state of a writable trie refused");
            return None;
        }
        trie::find_state(self, prefix).map(|node| StateId { node, trie: self.id })
    }

    /// Acquired iterator over the whole trie.
    pub fn new_iter(&self) -> Result<PatriciaIter<'_>> {
        self.new_iter_at(self.initial_state())
    }

    /// Acquired iterator over the words below `root`, relative to it.
    ///
    /// Fails with [`Error::ForeignState`] for a state of another trie.
    pub fn new_iter_at(&self, root: StateId) -> Result<PatriciaIter<'_>> {
        if root.trie != self.id {
            return Err(Error::ForeignState);
        }
        PatriciaIter::new(self, root)
    }

    /// This thread's cached writer token, created (released) on first use.
    #[allow(clippy::redundant_closure)]
    pub fn tls_writer_token(&self) -> Result<TlsWriterToken<'_>> {
        self.tls_writer_token_nn_with(|trie| WriterToken::new(trie))
    }

    /// Like [`tls_writer_token`](Self::tls_writer_token), building the cached
    /// token with `make` the first time, e.g. to install [`ValueHooks`].
    pub fn tls_writer_token_nn_with<F>(&self, make: F) -> Result<TlsWriterToken<'_>>
    where
        F: FnOnce(&Self) -> Result<WriterToken<'_>>,
    {
        let token = match self.tls_writers.remove(&platform::thread_id()) {
            Some((_, core)) => WriterToken {
                base: TokenBase::from_core(self, core),
            },
            None => {
                let token = make(self)?;
                debug_assert!(std::ptr::eq(token.trie(), self), "token of another trie");
                token
            }
        };
        Ok(TlsWriterToken { token })
    }

    /// This thread's cached reader token, already acquired.
    pub fn acquire_tls_reader_token(&self) -> Result<TlsReaderToken<'_>> {
        let core = match self.tls_readers.remove(&platform::thread_id()) {
            Some((_, core)) => core,
            None => TokenCore::register(self, TokenKind::Reader)?,
        };
        let mut token = ReaderToken {
            base: TokenBase::from_core(self, core),
        };
        token.acquire();
        Ok(TlsReaderToken { token })
    }

    // Park a token core in this thread's cache slot, or dispose of it when
    // the slot is taken.
    fn park(&self, cache: &DashMap<u64, TokenCore>, core: TokenCore) {
        let spare = match cache.entry(platform::thread_id()) {
            Entry::Vacant(slot) => {
                slot.insert(core);
                None
            }
            Entry::Occupied(_) => Some(core),
        };
        if let Some(core) = spare {
            drop(TokenBase::from_core(self, core));
        }
    }

    /// Emit pool gauges (caller decides cadence).
    pub fn report_mem_metrics(&self) {
        let st = self.mem_get_stat();
        gauge!("pptrie_mem_used_bytes").set(st.used_size as f64);
        gauge!("pptrie_mem_frag_bytes").set(st.frag_size as f64);
        gauge!("pptrie_mem_capacity_bytes").set(st.capacity as f64);
        gauge!("pptrie_lazy_free_blocks").set(st.lazy_free_cnt as f64);
        gauge!("pptrie_words").set(self.num_words() as f64);
    }
}

impl Drop for Patricia {
    fn drop(&mut self) {
        let readers = std::mem::take(&mut self.tls_readers);
        let writers = std::mem::take(&mut self.tls_writers);
        for (_, mut core) in readers.into_iter().chain(writers) {
            core.dispose(self);
        }
        debug!(
            "[DROP] words={} stat={:?}",
            self.num_words(),
            self.stats.snapshot()
        );
    }
}

impl std::fmt::Debug for Patricia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Patricia")
            .field("level", &self.level)
            .field("valsize", &self.valsize)
            .field("num_words", &self.num_words())
            .field("readonly", &self.is_readonly())
            .finish()
    }
}

/// Guard over this thread's cached reader token. Dropping it releases the
/// token and puts it back in the cache.
#[derive(Debug)]
pub struct TlsReaderToken<'t> {
    token: ReaderToken<'t>,
}

impl<'t> Deref for TlsReaderToken<'t> {
    type Target = ReaderToken<'t>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<'t> DerefMut for TlsReaderToken<'t> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

impl Drop for TlsReaderToken<'_> {
    fn drop(&mut self) {
        if self.token.is_acquired() {
            self.token.release();
        }
        let trie = self.token.trie();
        let core = self.token.base.take_core();
        trie.park(&trie.tls_readers, core);
    }
}

/// Guard over this thread's cached writer token. Dropping it releases the
/// token if acquired and puts it back in the cache.
#[derive(Debug)]
pub struct TlsWriterToken<'t> {
    token: WriterToken<'t>,
}

impl<'t> Deref for TlsWriterToken<'t> {
    type Target = WriterToken<'t>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<'t> DerefMut for TlsWriterToken<'t> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

impl Drop for TlsWriterToken<'_> {
    fn drop(&mut self) {
        if self.token.is_acquired() {
            self.token.release();
        }
        let trie = self.token.trie();
        let core = self.token.base.take_core();
        trie.park(&trie.tls_writers, core);
    }
}
