//! Reader / writer tokens.
//!
//! A token is a thread's ticket into one trie. While acquired it carries a
//! version stamp that keeps every block it might be reading out of reuse.
//! Dropping a token disposes of it; disposal never fails, it may only be
//! finished later by a reclamation scan.

use crate::constants::{GETCPU_INTERVAL, NIL_SLOT};
use crate::errors::Result;
use crate::mem_pool::Offset;
use crate::platform;
use crate::token_registry::SlotId;
use crate::types::{TokenKind, TokenState};
use crate::Patricia;
use log::trace;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;

/// Construction/destruction of the stored fixed-size value.
///
/// `init_value` copies `src` into the freshly carved `dst` (both exactly
/// `valsize` bytes) and may refuse the value by returning `false`.
/// `destroy_value` runs on values that were built but never published
/// because a concurrent writer inserted the same key first.
pub trait ValueHooks: Send + Sync {
    fn init_value(&mut self, dst: &mut [u8], src: &[u8]) -> bool {
        dst.copy_from_slice(src);
        true
    }

    fn destroy_value(&mut self, _val: &mut [u8]) {}
}

/// Plain byte copy; what a writer without hooks does.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyValue;

impl ValueHooks for CopyValue {}

/// Types that may be read straight out of a value slot.
///
/// # Safety
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid `Self`.
pub unsafe trait PlainValue: Copy + 'static {}

macro_rules! plain_value {
    ($($t:ty),*) => { $(unsafe impl PlainValue for $t {})* };
}
plain_value!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);
unsafe impl<T: PlainValue, const N: usize> PlainValue for [T; N] {}

/// Capability set shared by every token flavour.
pub trait Token {
    /// Enter the trie with a fresh version stamp.
    fn acquire(&mut self);
    /// Leave the trie; blocks freed from now on may be reclaimed past us.
    fn release(&mut self);
    /// Re-synchronise after other mutations. A no-op below
    /// `SingleThreadShared`.
    fn update(&mut self);
    fn dispose(self)
    where
        Self: Sized,
    {
        drop(self)
    }
}

/// Owner-private half of a token. Kept apart from the trie borrow so the
/// per-thread cache can park it.
pub(crate) struct TokenCore {
    pub slot: SlotId,
    pub kind: TokenKind,
    pub linked: bool,
    pub verseq: u64,
    pub value: Offset,
    pub acquires: u32,
    pub cpu: u32,
    pub thread_id: u64,
    pub hooks: Option<Box<dyn ValueHooks>>,
}

impl TokenCore {
    fn detached() -> Self {
        Self {
            slot: NIL_SLOT,
            kind: TokenKind::Reader,
            linked: false,
            verseq: 0,
            value: 0,
            acquires: 0,
            cpu: 0,
            thread_id: 0,
            hooks: None,
        }
    }

    pub(crate) fn register(trie: &Patricia, kind: TokenKind) -> Result<Self> {
        let thread_id = platform::thread_id();
        let cpu = platform::current_cpu();
        let slot = trie.registry.register(kind, thread_id, cpu)?;
        Ok(Self {
            slot,
            kind,
            thread_id,
            cpu,
            ..Self::detached()
        })
    }

    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        self.slot != NIL_SLOT
    }

    pub(crate) fn is_acquired(&self, trie: &Patricia) -> bool {
        self.is_live() && trie.registry.slot(self.slot).flags().state == TokenState::AcquireDone
    }

    pub(crate) fn acquire(&mut self, trie: &Patricia) {
        debug_assert!(self.is_live(), "acquire of a disposed token");
        debug_assert!(!self.is_acquired(trie), "token acquired twice");
        let reg = &trie.registry;
        reg.wait_released(self.slot, &trie.pool);
        let slot = reg.slot(self.slot);
        if self.acquires % GETCPU_INTERVAL == 0 {
            self.cpu = platform::current_cpu();
            slot.cpu.store(self.cpu, Ordering::Relaxed);
        }
        self.acquires = self.acquires.wrapping_add(1);
        self.thread_id = platform::thread_id();
        slot.thread_id.store(self.thread_id, Ordering::Relaxed);
        self.linked = trie.level.tracks_tokens() && !trie.is_readonly();
        self.verseq = reg.acquire(self.slot, self.linked);
    }

    pub(crate) fn release(&mut self, trie: &Patricia) {
        debug_assert!(self.is_acquired(trie), "release of a token that is not acquired");
        trie.registry.release(self.slot, &trie.pool, self.linked);
    }

    pub(crate) fn refresh(&mut self, trie: &Patricia) {
        if trie.level.tracks_tokens() && self.is_acquired(trie) {
            self.release(trie);
            self.acquire(trie);
        }
    }

    pub(crate) fn dispose(&mut self, trie: &Patricia) {
        if !self.is_live() {
            return;
        }
        if self.is_acquired(trie) {
            self.release(trie);
        }
        trace!("[TOKEN] dispose slot={} kind={:?}", self.slot, self.kind);
        trie.registry.dispose(self.slot, &trie.pool);
        self.slot = NIL_SLOT;
    }
}

/// What every token flavour exposes: the trie it belongs to, its stamp and
/// the value slot of the last successful lookup/insert.
pub struct TokenBase<'t> {
    trie: &'t Patricia,
    pub(crate) core: TokenCore,
}

impl<'t> TokenBase<'t> {
    pub(crate) fn new(trie: &'t Patricia, kind: TokenKind) -> Result<Self> {
        Ok(Self::from_core(trie, TokenCore::register(trie, kind)?))
    }

    pub(crate) fn from_core(trie: &'t Patricia, core: TokenCore) -> Self {
        Self { trie, core }
    }

    pub(crate) fn take_core(&mut self) -> TokenCore {
        std::mem::replace(&mut self.core, TokenCore::detached())
    }

    #[inline]
    pub fn trie(&self) -> &'t Patricia {
        self.trie
    }

    pub fn is_acquired(&self) -> bool {
        self.core.is_acquired(self.trie)
    }

    /// Version stamp of the last acquisition.
    #[inline]
    pub fn verseq(&self) -> u64 {
        self.core.verseq
    }

    /// Reclamation horizon as published to this token by the last scan.
    pub fn min_age(&self) -> u64 {
        self.trie.registry.slot(self.core.slot).min_age.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> TokenState {
        if !self.core.is_live() {
            return TokenState::DisposeDone;
        }
        self.trie.registry.slot(self.core.slot).flags().state
    }

    #[inline]
    pub fn kind(&self) -> TokenKind {
        self.core.kind
    }

    #[inline]
    pub fn thread_id(&self) -> u64 {
        self.core.thread_id
    }

    /// CPU the token was last acquired on (refreshed every few acquisitions).
    #[inline]
    pub fn cpu(&self) -> u32 {
        self.core.cpu
    }

    /// Value bytes of the last lookup hit or insert, `None` after a miss or a
    /// capacity-exhausted insert.
    pub fn value(&self) -> Option<&[u8]> {
        if self.core.value == 0 {
            return None;
        }
        // SAFETY: published values are immutable and never freed while the
        // trie lives; `self` borrows the trie.
        Some(unsafe { self.trie.pool.slice(self.core.value, self.trie.valsize) })
    }

    /// Copy the value out as `T`. `T` must be exactly `valsize` bytes.
    pub fn value_of<T: PlainValue>(&self) -> Option<T> {
        assert_eq!(std::mem::size_of::<T>(), self.trie.valsize, "value type size != valsize");
        // SAFETY: size checked above, any bit pattern is a valid T
        self.value()
            .map(|bytes| unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }

    /// In-place access to the stored value.
    ///
    /// # Safety
    /// No other thread may read or write this value for the lifetime of the
    /// returned reference.
    pub unsafe fn mutable_value_of<T: PlainValue>(&mut self) -> Option<&mut T> {
        assert_eq!(std::mem::size_of::<T>(), self.trie.valsize, "value type size != valsize");
        debug_assert!(std::mem::align_of::<T>() <= self.trie.mem_align_size());
        if self.core.value == 0 {
            return None;
        }
        let ptr = self.trie.pool.at(self.core.value) as *mut T;
        debug_assert_eq!(ptr as usize % std::mem::align_of::<T>(), 0);
        Some(&mut *ptr)
    }
}

impl Drop for TokenBase<'_> {
    fn drop(&mut self) {
        self.core.dispose(self.trie);
    }
}

impl std::fmt::Debug for TokenBase<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.core.kind)
            .field("slot", &self.core.slot)
            .field("verseq", &self.core.verseq)
            .field("state", &self.state())
            .finish()
    }
}

/// Token for lookups.
#[derive(Debug)]
pub struct ReaderToken<'t> {
    pub(crate) base: TokenBase<'t>,
}

impl<'t> ReaderToken<'t> {
    /// A released token; call [`Token::acquire`] before use.
    pub fn new(trie: &'t Patricia) -> Result<Self> {
        Ok(Self { base: TokenBase::new(trie, TokenKind::Reader)? })
    }

    pub(crate) fn with_kind(trie: &'t Patricia, kind: TokenKind) -> Result<Self> {
        Ok(Self { base: TokenBase::new(trie, kind)? })
    }

    /// `trie.lookup(key, self)`.
    pub fn lookup(&mut self, key: &[u8]) -> bool {
        let trie = self.base.trie;
        trie.lookup(key, self)
    }
}

impl<'t> Deref for ReaderToken<'t> {
    type Target = TokenBase<'t>;
    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<'t> DerefMut for ReaderToken<'t> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl Token for ReaderToken<'_> {
    fn acquire(&mut self) {
        let trie = self.base.trie;
        self.base.core.acquire(trie);
    }

    fn release(&mut self) {
        let trie = self.base.trie;
        self.base.core.release(trie);
    }

    fn update(&mut self) {
        let trie = self.base.trie;
        self.base.core.refresh(trie);
    }
}

/// Token for inserts; optionally carries [`ValueHooks`].
#[derive(Debug)]
pub struct WriterToken<'t> {
    pub(crate) base: TokenBase<'t>,
}

impl<'t> WriterToken<'t> {
    /// A released token with plain-copy values.
    pub fn new(trie: &'t Patricia) -> Result<Self> {
        Ok(Self { base: TokenBase::new(trie, TokenKind::Writer)? })
    }

    pub fn with_hooks(trie: &'t Patricia, hooks: Box<dyn ValueHooks>) -> Result<Self> {
        let mut base = TokenBase::new(trie, TokenKind::Writer)?;
        base.core.hooks = Some(hooks);
        Ok(Self { base })
    }

    /// `trie.insert(key, value, self)`.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let trie = self.base.trie;
        trie.insert(key, value, self)
    }
}

impl<'t> Deref for WriterToken<'t> {
    type Target = TokenBase<'t>;
    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl<'t> DerefMut for WriterToken<'t> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl Token for WriterToken<'_> {
    fn acquire(&mut self) {
        let trie = self.base.trie;
        self.base.core.acquire(trie);
    }

    fn release(&mut self) {
        let trie = self.base.trie;
        self.base.core.release(trie);
    }

    fn update(&mut self) {
        let trie = self.base.trie;
        self.base.core.refresh(trie);
    }
}

/// Uniquely owned token handles; dropping one disposes of the token.
pub type ReaderTokenPtr<'t> = ReaderToken<'t>;
pub type WriterTokenPtr<'t> = WriterToken<'t>;
