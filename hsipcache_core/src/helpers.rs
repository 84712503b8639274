//! Bit helpers for trie keys and IPv4 cache keys

use crate::constants::{FNV_OFFSET, FNV_PRIME, KEY_BITS};

/// Network mask with the top `prefix_len` bits of an IPv4 address set.
#[inline]
pub const fn prefix_mask4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        !(u32::MAX >> prefix_len)
    }
}

/// Truncate `addr` to its top `depth` bits.
#[inline]
pub const fn mask_addr4(addr: u32, depth: u8) -> u32 {
    addr & prefix_mask4(depth)
}

/// Mask with the top `prefix_len` bits of a 64-bit trie key set.
#[inline]
pub const fn mask(prefix_len: u8) -> u64 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= KEY_BITS {
        u64::MAX
    } else {
        !(u64::MAX >> prefix_len)
    }
}

// Canonicalise a key: zero host bits beyond `plen`.
#[inline(always)]
pub const fn canonical(key: u64, plen: u8) -> u64 {
    key & mask(plen)
}

/// Number of leading bits `a` and `b` share, capped at `max_len`.
#[inline]
pub fn common_prefix_len(a: u64, b: u64, max_len: u8) -> u8 {
    let diff = (a ^ b) & mask(max_len);
    if diff == 0 {
        return max_len;
    }
    (diff.leading_zeros() as u8).min(max_len)
}

/// Bit `index` of `key`, counting from the most significant bit.
#[inline]
pub fn get_bit(key: u64, index: u8) -> u8 {
    debug_assert!(index < KEY_BITS);
    ((key >> (KEY_BITS - 1 - index)) & 1) as u8
}

// Packs an offset and generation into a single u64 for ABA-safe links.
#[inline]
pub fn pack(offset: u32, gen: u32) -> u64 {
    ((gen as u64) << 32) | (offset as u64)
}

#[inline]
pub fn unpack(ptr: u64) -> (u32, u32) {
    (ptr as u32, (ptr >> 32) as u32)
}

pub fn fnv1a_64(s: &str) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in s.as_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
