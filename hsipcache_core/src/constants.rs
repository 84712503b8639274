//! Constants and layout parameters for the shared trie and the caches built on it

pub const PREFIX: &str = "hsipcache_"; // No Global\ here

pub const FNV_OFFSET: u64 = 0xcbf29ce484222325;
pub const FNV_PRIME: u64 = 0x100000001b3;

pub const CACHE_LINE: usize = 64;

/// Width of a trie key in bits.
pub const KEY_BITS: u8 = 64;

pub const DEFAULT_CAPACITY: usize = 65_536;

pub const HEADER_MAGIC: u64 = 0x4853495043414348; // "HSIPCACH"
pub const HEADER_VERSION: u16 = 1;

/// Address family tag written into cache keys.
pub const AF_INET: u8 = 2;

/// Default number of address bits the world-CIDR cache resolves.
pub const V4_CACHE_KEY_LEN: u8 = 16;

/// A reader gives up (and reports "no match") after this many torn snapshots.
pub const MAX_LOOKUP_RESTARTS: usize = 8;
