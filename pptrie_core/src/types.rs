//! Data structures shared across the trie, its pool and its tokens

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Concurrency level fixed at creation, ordered least to most concurrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConcurrentLevel {
    NoWriteReadOnly = 0,
    SingleThreadStrict = 1,
    /// Iterators holding a token stay valid across other mutations.
    SingleThreadShared = 2,
    OneWriteMultiRead = 3,
    MultiWriteMultiRead = 4,
}

impl ConcurrentLevel {
    /// Tokens are linked into the registry and frees go through lazy-free.
    #[inline]
    pub const fn tracks_tokens(self) -> bool {
        matches!(
            self,
            Self::SingleThreadShared | Self::OneWriteMultiRead | Self::MultiWriteMultiRead
        )
    }

    /// Other threads may touch the trie while we do.
    #[inline]
    pub const fn is_concurrent(self) -> bool {
        matches!(self, Self::OneWriteMultiRead | Self::MultiWriteMultiRead)
    }
}

impl Default for ConcurrentLevel {
    fn default() -> Self {
        Self::OneWriteMultiRead
    }
}

impl fmt::Display for ConcurrentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoWriteReadOnly => "NoWriteReadOnly",
            Self::SingleThreadStrict => "SingleThreadStrict",
            Self::SingleThreadShared => "SingleThreadShared",
            Self::OneWriteMultiRead => "OneWriteMultiRead",
            Self::MultiWriteMultiRead => "MultiWriteMultiRead",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenState {
    ReleaseDone = 0,
    AcquireDone = 1,
    ReleaseWait = 2,
    DisposeWait = 3,
    DisposeDone = 4,
}

impl TokenState {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::ReleaseDone,
            1 => Self::AcquireDone,
            2 => Self::ReleaseWait,
            3 => Self::DisposeWait,
            _ => Self::DisposeDone,
        }
    }
}

/// `{state, is_head}` as stored in one `AtomicU16`: state in the low byte,
/// is_head in the high byte. Both always change in a single atomic op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenFlags {
    pub state: TokenState,
    pub is_head: bool,
}

pub const IS_HEAD_BIT: u16 = 1 << 8;

impl TokenFlags {
    #[inline]
    pub const fn new(state: TokenState, is_head: bool) -> Self {
        Self { state, is_head }
    }

    #[inline]
    pub fn to_bits(self) -> u16 {
        self.state as u16 | if self.is_head { IS_HEAD_BIT } else { 0 }
    }

    #[inline]
    pub fn from_bits(bits: u16) -> Self {
        Self {
            state: TokenState::from_u8(bits as u8),
            is_head: bits & IS_HEAD_BIT != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenKind {
    Reader = 0,
    Writer = 1,
    Iterator = 2,
}

/// Identifier of a trie state; `initial_state()` is the live root.
///
/// Only the trie that handed it out accepts it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    /// 0 for the root, else a node offset of a frozen trie.
    pub(crate) node: u32,
    pub(crate) trie: u64,
}

/// Pool accounting snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemStat {
    /// Free block count per size class (`(i + 1) * ALIGN_SIZE` bytes).
    pub fastbin: Vec<usize>,
    pub used_size: usize,
    pub capacity: usize,
    /// fast-bin held + huge held
    pub frag_size: usize,
    pub huge_size: usize,
    pub huge_cnt: usize,
    pub lazy_free_sum: usize,
    pub lazy_free_cnt: usize,
}

/// Structural counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub n_fork: usize,
    pub n_split: usize,
    pub n_mark_final: usize,
    pub n_add_state_move: usize,
}

impl Stat {
    pub fn sum(&self) -> usize {
        self.n_fork + self.n_split + self.n_mark_final + self.n_add_state_move
    }
}

/// Live counterpart of `Stat` updated by writers.
#[derive(Debug, Default)]
pub(crate) struct AtomicStat {
    pub n_fork: AtomicUsize,
    pub n_split: AtomicUsize,
    pub n_mark_final: AtomicUsize,
    pub n_add_state_move: AtomicUsize,
}

impl AtomicStat {
    pub fn snapshot(&self) -> Stat {
        Stat {
            n_fork: self.n_fork.load(Ordering::Relaxed),
            n_split: self.n_split.load(Ordering::Relaxed),
            n_mark_final: self.n_mark_final.load(Ordering::Relaxed),
            n_add_state_move: self.n_add_state_move.load(Ordering::Relaxed),
        }
    }
}
