//! Constants and configuration for the Patricia trie

pub const CACHE_LINE: usize = 64;

/// Default memory budget handed to `Patricia::with_defaults`.
pub const DEFAULT_MAX_MEM: usize = 512 << 10;

/// Every block (node or value) starts on this boundary.
pub const ALIGN_SIZE: usize = 8;

/// Node links are 31-bit offsets, the top bit is the freeze flag.
pub const MAX_ARENA_BYTES: usize = (1 << 31) - 1;

/// Largest block served by the size-classed fast bins; bigger ones are "huge".
pub const MAX_FAST_BIN_SIZE: usize = 1024;
pub const FAST_BIN_COUNT: usize = MAX_FAST_BIN_SIZE / ALIGN_SIZE;

/// Queued lazy frees before a writer kicks a reclamation scan.
pub const LAZY_GC_THRESHOLD: usize = 64;

/// Token slot arena: segment `k` holds `FIRST_SEGMENT_SLOTS << k` slots.
pub const FIRST_SEGMENT_SLOTS: usize = 64;
pub const TOKEN_SEGMENTS: usize = 14;

/// Slot index bits inside the packed registry head word.
pub const SLOT_BITS: u32 = 20;
pub const NIL_SLOT: u32 = (1 << SLOT_BITS) - 1;

/// Re-read the CPU hint every this many acquisitions.
pub const GETCPU_INTERVAL: u32 = 32;
