//! Helper functions for Patricia trie operations

use crate::constants::{NIL_SLOT, SLOT_BITS};

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Length of the longest common prefix of two byte strings.
#[inline]
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len());
    // compare 8 bytes at a time before falling back to single bytes
    let mut i = 0;
    while i + 8 <= n {
        let x = u64::from_ne_bytes(a[i..i + 8].try_into().unwrap_or([0; 8]));
        let y = u64::from_ne_bytes(b[i..i + 8].try_into().unwrap_or([0; 8]));
        if x != y {
            break;
        }
        i += 8;
    }
    while i < n && a[i] == b[i] {
        i += 1;
    }
    i
}

// Packs a slot index and a 44-bit version stamp into one u64 so the registry
// head can move and mint a stamp with a single CAS.
#[inline]
pub fn pack(index: u32, stamp: u64) -> u64 {
    debug_assert!(index <= NIL_SLOT);
    (stamp << SLOT_BITS) | index as u64
}

#[inline]
pub fn unpack(word: u64) -> (u32, u64) {
    ((word & NIL_SLOT as u64) as u32, word >> SLOT_BITS)
}
