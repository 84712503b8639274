//! Control-plane side of hsipcache.
//!
//! The datapath only reads the shared world-CIDR cache; this crate owns the
//! writes. See [`WorldCidrsManager`].

pub mod manager;

pub use manager::{
    CidrSet, CidrSetId, ParseCidrError, ReconcileReport, SyncChecker, WorldCidrStore,
    WorldCidrsManager, DEFAULT_SYNC_POLL,
};
