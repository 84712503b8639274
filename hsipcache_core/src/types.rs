//! Data structures for the shared LPM trie

use crate::shmem_rwlock::{LockState, RawRwLock};
use crossbeam_queue::SegQueue;
use shared_memory::Shmem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize};
use std::sync::Arc;

/// Offset type: always 32 bits, portable across 32/64-bit platforms
pub type Offset = u32; // <= 4 294 967 295 bytes from base

/// Shared-memory header (aligned to cache line)
#[repr(C, align(64))]
pub struct Header {
    pub magic: u64,             // identifies a valid hsipcache region
    pub version: u16,           // layout version
    pub _reserved: [u8; 6],
    pub init_flag: AtomicU32,   // 0 = creator still initialising, 1 = ready
    pub lock: LockState,        // cross-process RW-lock state (handles are per process)
    pub next_index: AtomicU32,  // bump allocator index
    pub entries: AtomicU32,     // stored prefixes
    pub root: AtomicU64,        // packed (offset, generation) of the root node
    pub capacity: usize,        // max nodes in arena
    pub ref_count: AtomicUsize, // live-handle counter across processes
}

/// Trie node, each aligned to cache line.
///
/// Every field is atomic: a slot can be recycled while a reader in another
/// process still holds a stale link to it, and the reader detects that
/// through `generation`.
#[repr(C, align(64))]
pub struct Node {
    pub key: AtomicU64,        // canonical key, host bits zeroed
    pub left: AtomicU64,       // packed (offset, generation) of the 0-branch
    pub right: AtomicU64,      // packed (offset, generation) of the 1-branch
    pub generation: AtomicU32, // bumped every time the slot is reused
    pub prefix_len: AtomicU8,  // valid bits in key
    pub is_terminal: AtomicU8, // 1 = stored prefix, 0 = branching node only
}

/// Handle on a named shared-memory LPM trie.
///
/// One handle per process is enough; it is `Sync` and lookups never block.
pub struct LpmTrie {
    pub lock: RawRwLock,                 // this process's handles on the shared lock; dropped before the mapping
    pub shmem: Shmem,                    // keeps the mapping alive
    pub hdr: NonNull<Header>,            // header at the start of the mapping
    pub base: NonNull<u8>,               // base pointer for node offsets
    pub os_id: String,                   // mapping name, for unlink on last drop
    pub freelist: Arc<SegQueue<Offset>>, // slots retired by this process
}

// SAFETY: the raw pointers target the shared mapping owned by `shmem`, which
// lives as long as the handle. Mutation is serialised by the RW lock, and
// readers only perform atomic loads.
unsafe impl Send for LpmTrie {}
unsafe impl Sync for LpmTrie {}

impl std::panic::RefUnwindSafe for LpmTrie {}
impl std::panic::UnwindSafe for LpmTrie {}

/// Longest stored prefix covering a looked-up key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub key: u64,
    pub prefix_len: u8,
}
