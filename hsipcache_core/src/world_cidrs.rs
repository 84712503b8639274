//! World-CIDR cache: which IPv4 ranges are routable without the overlay.
//!
//! Only the (small) set of world ranges is tracked. Anything that misses is
//! treated as cluster-internal, so the cache size does not grow with the
//! number of remote nodes. Lookups resolve addresses to a fixed depth
//! (`cache_key_depth` bits), which lets many addresses share an entry.

use crate::constants::{AF_INET, DEFAULT_CAPACITY};
use crate::errors::Error;
use crate::helpers::mask_addr4;
use crate::types::LpmTrie;
use ipnet::Ipv4Net;
use log::{info, warn};
use std::mem::size_of;
use std::net::Ipv4Addr;

/// Region name the control plane and the datapath agree on.
pub const WORLD_CIDRS4_MAP: &str = "world_cidrs4";

/// Lookup key, laid out like an LPM-trie key: length header, then data.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldCidrKey4 {
    pub lpm_prefix_len: u32,
    pub family: u8,
    pub _pad: [u8; 3],
    pub ip: u32,
}

/// Bits of the key data that precede the address (family + padding).
pub const WORLD_CIDR_STATIC_PREFIX4: u8 =
    (8 * (size_of::<WorldCidrKey4>() - size_of::<u32>() - size_of::<u32>())) as u8;

/// LPM length covering the static part plus `prefix` address bits.
/// `prefix` is clamped to 32.
#[inline]
pub const fn world_cidr_prefix_len4(prefix: u8) -> u8 {
    let prefix = if prefix > 32 { 32 } else { prefix };
    WORLD_CIDR_STATIC_PREFIX4 + prefix
}

impl WorldCidrKey4 {
    /// Key for a stored range `ip/prefix_len`. Lengths above 32 mean /32.
    pub const fn new(ip: u32, prefix_len: u8) -> Self {
        Self {
            lpm_prefix_len: world_cidr_prefix_len4(prefix_len) as u32,
            family: AF_INET,
            _pad: [0; 3],
            ip: mask_addr4(ip, prefix_len),
        }
    }

    /// Key used to look `addr` up at the cache's resolution (clamped to 32).
    #[inline]
    pub const fn for_lookup(addr: u32, cache_key_depth: u8) -> Self {
        Self::new(addr, cache_key_depth)
    }

    /// Key data as the trie sees it: the bytes after the length header, big-endian.
    #[inline]
    pub const fn trie_key(&self) -> u64 {
        ((self.family as u64) << 56)
            | ((self._pad[0] as u64) << 48)
            | ((self._pad[1] as u64) << 40)
            | ((self._pad[2] as u64) << 32)
            | self.ip as u64
    }

    #[inline]
    pub const fn trie_prefix_len(&self) -> u8 {
        self.lpm_prefix_len as u8
    }
}

pub struct WorldCidrCache {
    trie: LpmTrie,
    depth: u8,
}

impl WorldCidrCache {
    /// Create or attach to the named cache. `cache_key_depth` is a property
    /// of the reader; writers may use any value in range.
    pub fn open(name: &str, capacity: usize, cache_key_depth: u8) -> Result<Self, Error> {
        if !(1..=32).contains(&cache_key_depth) {
            return Err(Error::InvalidConfig(format!(
                "cache_key_depth must be within 1..=32, got {cache_key_depth}"
            )));
        }
        let trie = LpmTrie::open(name, capacity)?;
        info!(
            "world CIDR cache {name}: depth={cache_key_depth} entries={}",
            trie.len()
        );
        Ok(Self {
            trie,
            depth: cache_key_depth,
        })
    }

    /// The well-known region with default capacity.
    pub fn open_default(cache_key_depth: u8) -> Result<Self, Error> {
        Self::open(WORLD_CIDRS4_MAP, DEFAULT_CAPACITY, cache_key_depth)
    }

    pub fn cache_key_depth(&self) -> u8 {
        self.depth
    }

    /// Whether `addr`, truncated to the cache depth, falls in a world range.
    /// An empty cache answers false for everything.
    #[inline]
    pub fn lookup4(&self, addr: u32) -> bool {
        let key = WorldCidrKey4::for_lookup(addr, self.depth);
        self.trie
            .lookup(key.trie_key(), key.trie_prefix_len())
            .is_some()
    }

    /// Add a world range. Host bits are dropped; adding twice is a no-op.
    pub fn insert(&self, cidr: Ipv4Net) -> Result<(), Error> {
        let net = cidr.trunc();
        if net.prefix_len() > self.depth {
            warn!(
                "world CIDR {net} is more specific than the cache depth /{}; lookups will never match it",
                self.depth
            );
        }
        let key = WorldCidrKey4::new(u32::from(net.network()), net.prefix_len());
        self.trie.insert(key.trie_key(), key.trie_prefix_len())
    }

    /// Drop a world range. Returns whether it was present.
    pub fn remove(&self, cidr: Ipv4Net) -> Result<bool, Error> {
        let net = cidr.trunc();
        let key = WorldCidrKey4::new(u32::from(net.network()), net.prefix_len());
        self.trie.remove(key.trie_key(), key.trie_prefix_len())
    }

    /// Whether exactly this range is stored.
    pub fn contains(&self, cidr: Ipv4Net) -> bool {
        let net = cidr.trunc();
        let key = WorldCidrKey4::new(u32::from(net.network()), net.prefix_len());
        self.trie.contains(key.trie_key(), key.trie_prefix_len())
    }

    /// Every stored range, in address order.
    pub fn entries(&self) -> Vec<Ipv4Net> {
        self.trie
            .entries()
            .into_iter()
            .filter(|m| {
                (m.key >> 56) as u8 == AF_INET && m.prefix_len >= WORLD_CIDR_STATIC_PREFIX4
            })
            .filter_map(|m| {
                Ipv4Net::new(
                    Ipv4Addr::from(m.key as u32),
                    m.prefix_len - WORLD_CIDR_STATIC_PREFIX4,
                )
                .ok()
            })
            .collect()
    }

    pub fn clear(&self) -> Result<(), Error> {
        self.trie.clear()
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    pub fn available_capacity(&self) -> usize {
        self.trie.available_capacity()
    }

    /// Underlying trie, for capacity reporting and maintenance.
    pub fn trie(&self) -> &LpmTrie {
        &self.trie
    }
}
