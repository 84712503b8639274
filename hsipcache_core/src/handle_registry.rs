use crate::{errors::ErrorCode, EncapClassifier, EndpointMap, WorldCidrCache};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle ID type - safer than raw pointers. 0 is never issued.
pub type HandleId = u64;

/// The classifier as held behind a C handle.
pub type SharedClassifier = EncapClassifier<Arc<WorldCidrCache>, Arc<EndpointMap>>;

/// IDs are unique across every registry, so a handle of the wrong kind is
/// rejected instead of aliasing another object.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct Registry<T> {
    handles: DashMap<HandleId, Arc<T>>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            handles: DashMap::new(),
        }
    }

    pub fn register(&self, value: T) -> HandleId {
        self.register_arc(Arc::new(value))
    }

    pub fn register_arc(&self, value: Arc<T>) -> HandleId {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, value);
        id
    }

    /// Clone out the object; the shard lock is released before the caller uses it.
    pub fn get(&self, id: HandleId) -> Result<Arc<T>, ErrorCode> {
        if id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ErrorCode::InvalidHandle)
    }

    /// Drop the registry's reference. Objects still shared (e.g. a cache a
    /// classifier holds) live on until their last user goes away.
    pub fn unregister(&self, id: HandleId) -> Result<(), ErrorCode> {
        if id == 0 {
            return Err(ErrorCode::InvalidHandle);
        }
        self.handles
            .remove(&id)
            .map(|_| ())
            .ok_or(ErrorCode::InvalidHandle)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

pub static WORLD_CACHES: Lazy<Registry<WorldCidrCache>> = Lazy::new(Registry::new);
pub static ENDPOINT_MAPS: Lazy<Registry<EndpointMap>> = Lazy::new(Registry::new);
pub static CLASSIFIERS: Lazy<Registry<SharedClassifier>> = Lazy::new(Registry::new);
