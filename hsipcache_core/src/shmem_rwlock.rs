//! Cross-process read–write lock whose state fits in shared memory and
//! works on Linux, macOS and Windows.
//!
//! The lock bytes (`LockState`) live in the shared region; each process keeps
//! its own OS handles in a `RawRwLock` that points at them. Writers take
//! preference: once the writer bit is set new readers back off until it
//! clears.
use crate::errors::Error;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};
use raw_sync::events::{Event as RawEvent, EventImpl, EventInit, EventState};
use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex as RawMutex};
use raw_sync::Timeout;
use std::time::Duration;

const BUF_LEN: usize = 128;

const WRITER_BIT: u32 = 0x8000_0000;
const READER_MASK: u32 = WRITER_BIT - 1;

/// Shared, position-independent part of the lock.
#[repr(C, align(8))]
pub struct LockState {
    mutex_buf: [u8; BUF_LEN],
    event_buf: [u8; BUF_LEN],
    pub readers: AtomicU32,
}

impl LockState {
    pub const fn zeroed() -> Self {
        Self {
            mutex_buf: [0; BUF_LEN],
            event_buf: [0; BUF_LEN],
            readers: AtomicU32::new(0),
        }
    }
}

/// Per-process view of a `LockState`.
pub struct RawRwLock {
    state: NonNull<LockState>,
    mutex: Box<dyn LockImpl>,
    event: Box<dyn EventImpl>,
}

unsafe impl Send for RawRwLock {}
unsafe impl Sync for RawRwLock {}

impl RawRwLock {
    /// Initialise fresh lock state in place and attach to it.
    ///
    /// # Safety
    /// `state` must be valid, aligned, and outlive the returned handle. No
    /// other process may be using the state yet.
    pub unsafe fn init(state: *mut LockState) -> Result<Self, Error> {
        debug_assert!(RawMutex::size_of(None) <= BUF_LEN);
        debug_assert!(RawEvent::size_of(None) <= BUF_LEN);

        ptr::write(state, LockState::zeroed());
        let st = &mut *state;
        let (mutex, _) = RawMutex::new(st.mutex_buf.as_mut_ptr(), ptr::null_mut())
            .map_err(|e| Error::Lock(format!("mutex init failed: {e}")))?;
        let (event, _) = RawEvent::new(st.event_buf.as_mut_ptr(), true)
            .map_err(|e| Error::Lock(format!("event init failed: {e}")))?;
        Ok(Self {
            state: NonNull::new_unchecked(state),
            mutex,
            event,
        })
    }

    /// Attach to lock state another process already initialised.
    ///
    /// # Safety
    /// `state` must point at a `LockState` set up by [`RawRwLock::init`] and
    /// outlive the returned handle.
    pub unsafe fn attach(state: *mut LockState) -> Result<Self, Error> {
        let st = NonNull::new(state).ok_or_else(|| Error::Lock("null lock state".into()))?;
        let raw = &mut *st.as_ptr();
        let (mutex, _) = RawMutex::from_existing(raw.mutex_buf.as_mut_ptr(), ptr::null_mut())
            .map_err(|e| Error::Lock(format!("re-open mutex failed: {e}")))?;
        let (event, _) = RawEvent::from_existing(raw.event_buf.as_mut_ptr())
            .map_err(|e| Error::Lock(format!("re-open event failed: {e}")))?;
        Ok(Self {
            state: st,
            mutex,
            event,
        })
    }

    /// Process-private lock on the heap.
    ///
    /// Test support: the trie always places its lock in the region via
    /// [`RawRwLock::init`] / [`RawRwLock::attach`].
    #[doc(hidden)]
    pub fn new_heap() -> Result<HeapRwLock, Error> {
        let mut state = Box::new(LockState::zeroed());
        let lock = unsafe { Self::init(&mut *state as *mut LockState)? };
        Ok(HeapRwLock {
            lock,
            _state: state,
        })
    }

    #[inline(always)]
    fn state(&self) -> &LockState {
        unsafe { self.state.as_ref() }
    }

    /// Number of readers currently inside.
    pub fn readers(&self) -> u32 {
        self.state().readers.load(Ordering::Acquire) & READER_MASK
    }

    /// Acquire a **shared** (read) lock.
    /// Backs off while a writer holds the lock or is waiting for it.
    pub fn read_lock(&self) -> ReadGuard<'_> {
        let readers = &self.state().readers;
        loop {
            let cur = readers.load(Ordering::Acquire);
            if cur & WRITER_BIT != 0 {
                std::thread::yield_now();
                continue;
            }
            if readers
                .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return ReadGuard { lock: self };
            }
        }
    }

    fn read_unlock(&self) {
        let prev = self.state().readers.fetch_sub(1, Ordering::Release);
        if prev == (WRITER_BIT | 1) {
            // last reader out while a writer waits
            let _ = self.event.set(EventState::Signaled);
        }
    }

    /// Acquire an **exclusive** (write) lock.
    /// Blocks new readers and waits for in-flight readers to drain.
    pub fn write_lock(&self) -> Result<WriteGuard<'_>, Error> {
        let guard = self
            .mutex
            .lock()
            .map_err(|e| Error::Lock(format!("mutex lock failed: {e}")))?;
        let readers = &self.state().readers;
        if readers.fetch_or(WRITER_BIT, Ordering::AcqRel) & READER_MASK != 0 {
            // The event is only a wake-up hint; the counter is authoritative.
            while readers.load(Ordering::Acquire) & READER_MASK != 0 {
                let _ = self.event.wait(Timeout::Val(Duration::from_millis(1)));
            }
        }
        Ok(WriteGuard {
            lock: self,
            _guard: guard,
        })
    }

    /// Try to acquire an **exclusive** lock without waiting on readers.
    /// Returns `None` if the mutex stayed busy for `timeout` or readers are inside.
    ///
    /// Test support: writers in this crate use [`RawRwLock::write_lock`].
    #[doc(hidden)]
    pub fn try_write_lock(&self, timeout: Timeout) -> Option<WriteGuard<'_>> {
        let guard = self.mutex.try_lock(timeout).ok()?;
        self.state()
            .readers
            .compare_exchange(0, WRITER_BIT, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(WriteGuard {
            lock: self,
            _guard: guard,
        })
    }
}

/// A private lock together with the heap state it points at. Test support.
#[doc(hidden)]
pub struct HeapRwLock {
    lock: RawRwLock,
    _state: Box<LockState>,
}

impl std::ops::Deref for HeapRwLock {
    type Target = RawRwLock;

    fn deref(&self) -> &RawRwLock {
        &self.lock
    }
}

/// Represents an acquired exclusive (write) lock.
/// The lock is released when this guard is dropped.
#[must_use = "if unused the lock will immediately unlock"]
pub struct WriteGuard<'a> {
    lock: &'a RawRwLock,
    _guard: LockGuard<'a>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock
            .state()
            .readers
            .fetch_and(!WRITER_BIT, Ordering::Release);
    }
}

/// Represents an acquired shared (read) lock.
/// The lock is released when this guard is dropped.
#[must_use = "if unused the lock will immediately unlock"]
pub struct ReadGuard<'a> {
    lock: &'a RawRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}
