pub mod config;
pub mod constants;
pub mod decision;
pub mod endpoints;
pub mod errors;
pub mod handle_registry;
pub mod helpers;
pub mod platform;
pub mod shmem_rwlock;
pub mod telemetry;
pub mod types;
pub mod world_cidrs;

pub use config::DatapathConfig;
pub use decision::{DecisionStats, EncapClassifier, EndpointLookup, Verdict, WorldCidrLookup};
pub use endpoints::EndpointMap;
pub use errors::Error;
pub use types::{LpmTrie, Match};
pub use world_cidrs::WorldCidrCache;

use constants::*;
use crossbeam_epoch as epoch;
use helpers::*;
use log::{debug, info, trace, warn};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;
use shared_memory::{ShmemConf, ShmemError};
use shmem_rwlock::{LockState, RawRwLock};
use std::{
    mem::{align_of, size_of},
    ptr::{self, NonNull},
    sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};
use crossbeam_queue::SegQueue;
use types::{Header, Node, Offset};

// ===== Compile-time assertions for alignment and size =====
const HEADER_PADDED: usize = helpers::align_up(size_of::<Header>(), CACHE_LINE);
const NODE_SIZE: usize = size_of::<Node>();
const _: () = assert!(HEADER_PADDED % CACHE_LINE == 0);
const _: () = assert!(align_of::<Header>() == CACHE_LINE);
const _: () = assert!(align_of::<Node>() == CACHE_LINE);
const _: () = assert!(NODE_SIZE == CACHE_LINE);

/// How long an opener waits for the creator to finish the header.
const INIT_POLL: Duration = Duration::from_millis(10);
const INIT_POLLS: u32 = 500;

/// Consistent copy of one node, taken by a lock-free reader.
struct NodeSnapshot {
    key: u64,
    prefix_len: u8,
    terminal: bool,
    left: u64,
    right: u64,
}

impl Node {
    /// Writer-side (re)initialisation; the slot is unreachable until linked.
    fn reset(&self, key: u64, prefix_len: u8, terminal: bool) {
        self.key.store(key, Ordering::Relaxed);
        self.prefix_len.store(prefix_len, Ordering::Relaxed);
        self.is_terminal.store(terminal as u8, Ordering::Relaxed);
        self.left.store(0, Ordering::Relaxed);
        self.right.store(0, Ordering::Relaxed);
    }

    /// Read all fields, or `None` if the slot was recycled under us.
    #[inline(always)]
    fn snapshot(&self, expected_gen: u32) -> Option<NodeSnapshot> {
        if self.generation.load(Ordering::Acquire) != expected_gen {
            return None;
        }
        let snap = NodeSnapshot {
            key: self.key.load(Ordering::Acquire),
            prefix_len: self.prefix_len.load(Ordering::Acquire),
            terminal: self.is_terminal.load(Ordering::Acquire) == 1,
            left: self.left.load(Ordering::Acquire),
            right: self.right.load(Ordering::Acquire),
        };
        // Pairs with the release fence in `alloc_node`: if any field above came
        // from a reuse of this slot, the re-check sees the bumped generation.
        fence(Ordering::Acquire);
        if self.generation.load(Ordering::Relaxed) != expected_gen {
            return None;
        }
        Some(snap)
    }

    #[inline(always)]
    fn child(&self, bit: u8) -> &AtomicU64 {
        if bit == 0 {
            &self.left
        } else {
            &self.right
        }
    }
}

impl LpmTrie {
    // ---- logging bootstrapper -------------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            // Fallback: simple env_logger with RFC-3339 ts off.
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    /// Create or attach to the shared-memory trie called `name`.
    ///
    /// Every process must pass the same `capacity`; a region created with a
    /// different one is rejected with [`Error::HeaderMismatch`].
    pub fn open(name: &str, capacity: usize) -> Result<Self, Error> {
        Self::ensure_logging();
        telemetry::init();
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        // header + nodes must stay addressable by a u32 offset
        let max_nodes = (u32::MAX as usize - HEADER_PADDED) / NODE_SIZE;
        if capacity > max_nodes {
            return Err(Error::CapacityExceeded);
        }
        let os_id = platform::make_os_id(PREFIX, fnv1a_64(name));
        let region_size = HEADER_PADDED + capacity * NODE_SIZE;

        let conf = || ShmemConf::new().os_id(&os_id).size(region_size);
        let (mut shmem, is_creator) = match conf().create() {
            Ok(m) => (m, true),
            Err(ShmemError::MappingIdExists) => (conf().open()?, false),
            Err(e) => return Err(e.into()),
        };
        // unlinking is driven by the shared ref_count, not by whoever created it
        shmem.set_owner(false);
        if shmem.len() < region_size {
            return Err(Error::HeaderMismatch);
        }

        let base = NonNull::new(shmem.as_ptr()).ok_or_else(|| Error::Shmem("null mapping".into()))?;
        let hdr = base.cast::<Header>();
        debug_assert_eq!(
            memoffset::offset_of!(Header, lock) % align_of::<LockState>(),
            0
        );
        let lock = if is_creator {
            unsafe { Self::init_header(hdr.as_ptr(), capacity)? }
        } else {
            unsafe { Self::attach_header(hdr.as_ptr(), capacity)? }
        };
        let handles = unsafe { hdr.as_ref() }.ref_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "[OPEN] name={name} os_id={os_id} capacity={capacity} creator={is_creator} handles={handles}"
        );

        Ok(Self {
            lock,
            shmem,
            hdr,
            base,
            os_id,
            freelist: Arc::new(SegQueue::new()),
        })
    }

    unsafe fn init_header(hdr: *mut Header, capacity: usize) -> Result<RawRwLock, Error> {
        ptr::write(
            hdr,
            Header {
                magic: HEADER_MAGIC,
                version: HEADER_VERSION,
                _reserved: [0; 6],
                init_flag: AtomicU32::new(0),
                lock: LockState::zeroed(),
                next_index: AtomicU32::new(0),
                entries: AtomicU32::new(0),
                root: AtomicU64::new(0),
                capacity,
                ref_count: AtomicUsize::new(0),
            },
        );
        let lock = RawRwLock::init(ptr::addr_of_mut!((*hdr).lock))?;
        (*hdr).init_flag.store(1, Ordering::Release);
        Ok(lock)
    }

    unsafe fn attach_header(hdr: *mut Header, capacity: usize) -> Result<RawRwLock, Error> {
        let h = &*hdr;
        let mut polls = 0;
        while h.init_flag.load(Ordering::Acquire) == 0 {
            if polls == INIT_POLLS {
                return Err(Error::Shmem("region creator never finished initialising".into()));
            }
            polls += 1;
            std::thread::sleep(INIT_POLL);
        }
        if h.magic != HEADER_MAGIC || h.version != HEADER_VERSION || h.capacity != capacity {
            warn!(
                "[OPEN] header mismatch: magic={:x} version={} capacity={} (wanted {})",
                h.magic, h.version, h.capacity, capacity
            );
            return Err(Error::HeaderMismatch);
        }
        RawRwLock::attach(ptr::addr_of_mut!((*hdr).lock))
    }

    /// Remove the named region regardless of live handles. Handles already
    /// open keep their mapping; the next `open` creates a fresh region.
    pub fn destroy(name: &str) {
        let os_id = platform::make_os_id(PREFIX, fnv1a_64(name));
        info!("[DESTROY] os_id={os_id}");
        platform::platform_drop(&os_id);
    }

    #[inline(always)]
    fn header(&self) -> &Header {
        unsafe { self.hdr.as_ref() }
    }

    #[inline(always)]
    fn node(&self, off: Offset) -> &Node {
        unsafe { &*(self.base.as_ptr().add(off as usize) as *const Node) }
    }

    /// Resolve a packed link. Offsets outside the arena read as "no node".
    #[inline(always)]
    fn follow(&self, packed: u64) -> Option<(&Node, u32)> {
        if packed == 0 {
            return None;
        }
        let (off, gen) = unpack(packed);
        let off_usize = off as usize;
        let end = HEADER_PADDED + self.header().capacity * NODE_SIZE;
        if off_usize < HEADER_PADDED || off_usize >= end || (off_usize - HEADER_PADDED) % NODE_SIZE != 0 {
            return None;
        }
        Some((self.node(off), gen))
    }

    /// Longest stored prefix of length ≤ `max_prefix_len` that covers `key`.
    ///
    /// Lock-free and allocation-free. The walk visits at most `KEY_BITS + 1`
    /// nodes per attempt; if concurrent slot reuse tears more than
    /// `MAX_LOOKUP_RESTARTS` attempts the lookup reports no match.
    pub fn lookup(&self, key: u64, max_prefix_len: u8) -> Option<Match> {
        let max_plen = max_prefix_len.min(KEY_BITS);
        let _guard = epoch::pin();
        'attempt: for _ in 0..MAX_LOOKUP_RESTARTS {
            let mut best = None;
            let mut link = self.header().root.load(Ordering::Acquire);
            // every hop strictly lengthens the prefix
            for _ in 0..=KEY_BITS {
                let Some((node, gen)) = self.follow(link) else {
                    return best;
                };
                let Some(snap) = node.snapshot(gen) else {
                    continue 'attempt;
                };
                if snap.prefix_len > max_plen
                    || common_prefix_len(key, snap.key, snap.prefix_len) < snap.prefix_len
                {
                    return best;
                }
                if snap.terminal {
                    best = Some(Match {
                        key: snap.key,
                        prefix_len: snap.prefix_len,
                    });
                }
                if snap.prefix_len >= KEY_BITS {
                    return best;
                }
                link = if get_bit(key, snap.prefix_len) == 0 {
                    snap.left
                } else {
                    snap.right
                };
            }
            return best;
        }
        None
    }

    /// Whether exactly `key/prefix_len` is stored.
    pub fn contains(&self, key: u64, prefix_len: u8) -> bool {
        prefix_len <= KEY_BITS
            && self
                .lookup(canonical(key, prefix_len), prefix_len)
                .is_some_and(|m| m.prefix_len == prefix_len)
    }

    /// Store `key/prefix_len`. Host bits are zeroed; storing twice is a no-op.
    pub fn insert(&self, key: u64, prefix_len: u8) -> Result<(), Error> {
        if prefix_len > KEY_BITS {
            return Err(Error::InvalidPrefix);
        }
        let key = canonical(key, prefix_len);
        let hdr = self.header();
        let _write_guard = self.lock.write_lock()?;
        debug!("[INSERT] key={key:x} prefix_len={prefix_len}");

        let mut link: &AtomicU64 = &hdr.root;
        loop {
            let cur = link.load(Ordering::Acquire);
            let Some((node, _)) = self.follow(cur) else {
                trace!("[INSERT] empty link, new leaf");
                let leaf = self.alloc_node(key, prefix_len, true)?;
                link.store(leaf, Ordering::Release);
                return Ok(self.stored());
            };
            let node_key = node.key.load(Ordering::Relaxed);
            let node_plen = node.prefix_len.load(Ordering::Relaxed);
            let cpl = common_prefix_len(key, node_key, prefix_len.min(node_plen));
            trace!("[INSERT] at key={node_key:x}/{node_plen} cpl={cpl}");

            if cpl == node_plen && cpl == prefix_len {
                // a branching node may already sit exactly here
                if node.is_terminal.swap(1, Ordering::AcqRel) == 0 {
                    return Ok(self.stored());
                }
                trace!("[INSERT] already stored");
                return Ok(());
            }

            if cpl == prefix_len {
                // the new prefix covers `node`: insert above it
                let above = self.alloc_node(key, prefix_len, true)?;
                let (above_off, _) = unpack(above);
                self.node(above_off)
                    .child(get_bit(node_key, prefix_len))
                    .store(cur, Ordering::Relaxed);
                link.store(above, Ordering::Release);
                return Ok(self.stored());
            }

            if cpl == node_plen {
                link = node.child(get_bit(key, node_plen));
                continue;
            }

            // keys diverge below both prefixes: fork at `cpl`
            let leaf = self.alloc_node(key, prefix_len, true)?;
            let fork = match self.alloc_node(canonical(key, cpl), cpl, false) {
                Ok(f) => f,
                Err(e) => {
                    // never published, safe to hand straight back
                    self.freelist.push(unpack(leaf).0);
                    return Err(e);
                }
            };
            let fork_node = self.node(unpack(fork).0);
            let leaf_bit = get_bit(key, cpl);
            fork_node.child(leaf_bit).store(leaf, Ordering::Relaxed);
            fork_node.child(leaf_bit ^ 1).store(cur, Ordering::Relaxed);
            link.store(fork, Ordering::Release);
            trace!("[INSERT] forked at {cpl}");
            return Ok(self.stored());
        }
    }

    fn stored(&self) {
        self.header().entries.fetch_add(1, Ordering::Relaxed);
        counter!("hsipcache_inserts_total").increment(1);
    }

    /// Remove exactly `key/prefix_len`. Returns whether it was stored.
    pub fn remove(&self, key: u64, prefix_len: u8) -> Result<bool, Error> {
        if prefix_len > KEY_BITS {
            return Err(Error::InvalidPrefix);
        }
        let key = canonical(key, prefix_len);
        let hdr = self.header();
        let _write_guard = self.lock.write_lock()?;
        debug!("[REMOVE] key={key:x} prefix_len={prefix_len}");

        // links from the root down to the target, for pruning on the way back
        let mut path: Vec<&AtomicU64> = Vec::with_capacity(KEY_BITS as usize + 1);
        let mut link: &AtomicU64 = &hdr.root;
        loop {
            let Some((node, _)) = self.follow(link.load(Ordering::Acquire)) else {
                debug!("[REMOVE] not stored");
                return Ok(false);
            };
            let node_plen = node.prefix_len.load(Ordering::Relaxed);
            let node_key = node.key.load(Ordering::Relaxed);
            if node_plen > prefix_len || common_prefix_len(key, node_key, node_plen) < node_plen {
                debug!("[REMOVE] not stored");
                return Ok(false);
            }
            path.push(link);
            if node_plen == prefix_len {
                if node.is_terminal.swap(0, Ordering::AcqRel) == 0 {
                    debug!("[REMOVE] branching node only, nothing stored");
                    return Ok(false);
                }
                hdr.entries.fetch_sub(1, Ordering::Relaxed);
                counter!("hsipcache_removes_total").increment(1);
                for l in path.iter().rev() {
                    if !self.try_prune(l) {
                        break;
                    }
                }
                return Ok(true);
            }
            link = node.child(get_bit(key, node_plen));
        }
    }

    /// Drop the node behind `link` if it no longer stores a prefix and has at
    /// most one child. Returns true when the link became empty, i.e. the
    /// parent may have turned unary in turn.
    fn try_prune(&self, link: &AtomicU64) -> bool {
        let packed = link.load(Ordering::Acquire);
        let Some((node, _)) = self.follow(packed) else {
            return false;
        };
        if node.is_terminal.load(Ordering::Acquire) == 1 {
            return false;
        }
        let left = node.left.load(Ordering::Acquire);
        let right = node.right.load(Ordering::Acquire);
        let (replacement, emptied) = match (left, right) {
            (0, 0) => (0, true),
            (l, 0) => (l, false),
            (0, r) => (r, false),
            _ => return false,
        };
        link.store(replacement, Ordering::Release);
        self.retire_offset(unpack(packed).0);
        trace!("[PRUNE] retired node, emptied={emptied}");
        emptied
    }

    /// Hand a slot back once no reader in this process can still hold it.
    /// Readers elsewhere notice reuse through the generation counter.
    pub fn retire_offset(&self, off: Offset) {
        let freelist = Arc::clone(&self.freelist);
        epoch::pin().defer(move || freelist.push(off));
    }

    /// Claim a slot (freelist first, then bump) and initialise it unlinked.
    /// Returns the packed link to it.
    fn alloc_node(&self, key: u64, prefix_len: u8, terminal: bool) -> Result<u64, Error> {
        let hdr = self.header();
        let off = match self.freelist.pop() {
            Some(off) => off,
            None => {
                let index = hdr.next_index.load(Ordering::Relaxed);
                if (index as usize) < hdr.capacity {
                    hdr.next_index.store(index + 1, Ordering::Relaxed);
                    HEADER_PADDED as Offset + index * NODE_SIZE as Offset
                } else {
                    // arena full: give deferred frees one chance to land
                    epoch::pin().flush();
                    self.freelist.pop().ok_or_else(|| {
                        warn!("[ALLOC] capacity {} exhausted", hdr.capacity);
                        Error::CapacityExceeded
                    })?
                }
            }
        };
        let node = self.node(off);
        let gen = node.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        // the bump must be visible before any recycled field value is
        fence(Ordering::Release);
        node.reset(key, prefix_len, terminal);
        trace!("[ALLOC] off={off} gen={gen}");
        Ok(pack(off, gen))
    }

    /// Snapshot of every stored prefix, ordered by key then length.
    /// Takes the shared lock so the walk never races a writer.
    pub fn entries(&self) -> Vec<Match> {
        let _read_guard = self.lock.read_lock();
        let mut out = Vec::with_capacity(self.len());
        let mut stack = vec![self.header().root.load(Ordering::Acquire)];
        // at most `capacity` live nodes; the bound guards against a corrupted region
        let mut budget = self.header().capacity;
        while let Some(packed) = stack.pop() {
            let Some((node, _)) = self.follow(packed) else {
                continue;
            };
            if budget == 0 {
                warn!("[ENTRIES] walk exceeded capacity, region looks corrupted");
                break;
            }
            budget -= 1;
            if node.is_terminal.load(Ordering::Acquire) == 1 {
                out.push(Match {
                    key: node.key.load(Ordering::Acquire),
                    prefix_len: node.prefix_len.load(Ordering::Acquire),
                });
            }
            stack.push(node.right.load(Ordering::Acquire));
            stack.push(node.left.load(Ordering::Acquire));
        }
        out.sort_unstable_by_key(|m| (m.key, m.prefix_len));
        out
    }

    /// Drop every stored prefix.
    pub fn clear(&self) -> Result<(), Error> {
        let hdr = self.header();
        let _write_guard = self.lock.write_lock()?;
        let root = hdr.root.swap(0, Ordering::AcqRel);
        hdr.entries.store(0, Ordering::Relaxed);

        let mut stack = vec![root];
        let mut retired = 0usize;
        while let Some(packed) = stack.pop() {
            let Some((node, _)) = self.follow(packed) else {
                continue;
            };
            if retired == hdr.capacity {
                break;
            }
            stack.push(node.left.load(Ordering::Acquire));
            stack.push(node.right.load(Ordering::Acquire));
            self.retire_offset(unpack(packed).0);
            retired += 1;
        }
        info!("[CLEAR] {} retired {retired} nodes", self.os_id);
        Ok(())
    }

    /// Number of stored prefixes.
    pub fn len(&self) -> usize {
        self.header().entries.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity
    }

    /// Slots this process can hand out right now (never-used + recycled).
    pub fn available_capacity(&self) -> usize {
        let hdr = self.header();
        let used = hdr.next_index.load(Ordering::Acquire) as usize;
        hdr.capacity - used.min(hdr.capacity) + self.freelist.len()
    }

    /// Run deferred frees that are already safe so their slots can be reused.
    pub fn flush(&self) {
        epoch::pin().flush();
    }

    /// Emit gauges (caller decides cadence).
    pub fn report_capacity_metrics(&self) {
        gauge!("hsipcache_free_slots", "region" => self.os_id.clone())
            .set(self.available_capacity() as f64);
        gauge!("hsipcache_entries", "region" => self.os_id.clone()).set(self.len() as f64);
    }

    /// Shared-memory name backing this trie.
    pub fn os_id(&self) -> &str {
        &self.os_id
    }
}

// C ABI
pub mod public_api;

// Re-export all public API functions at the crate root
pub use public_api::*;

impl Drop for LpmTrie {
    fn drop(&mut self) {
        let prev = self.header().ref_count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            debug!("[DROP] last handle on {}, unlinking", self.os_id);
            platform::platform_drop(&self.os_id);
        }
        // The mapping itself is unmapped by Shmem's Drop
    }
}
