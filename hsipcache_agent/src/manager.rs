//! Keeps the shared world-CIDR cache in line with the configured CIDR sets.
//!
//! Sets arrive as add/update/delete events. The manager stores them as the
//! desired state and, once the source of truth reports it is fully synced,
//! reconciles the cache against their union.

use hsipcache_core::{Error, WorldCidrCache};
use ipnet::Ipv4Net;
use ipnetwork::Ipv4Network;
use log::{debug, error, info, warn};
use metrics::counter;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_SYNC_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CidrSetId {
    pub namespace: String,
    pub name: String,
}

impl CidrSetId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CidrSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A named group of world-routable ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrSet {
    pub id: CidrSetId,
    pub cidrs: Vec<Ipv4Net>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCidrError {
    pub input: String,
    pub reason: String,
}

impl fmt::Display for ParseCidrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for ParseCidrError {}

impl CidrSet {
    pub fn new(id: CidrSetId, cidrs: Vec<Ipv4Net>) -> Self {
        Self { id, cidrs }
    }

    /// Parse textual IPv4 CIDRs; a bare address counts as a /32.
    /// Host bits are dropped.
    pub fn parse(id: CidrSetId, cidrs: &[&str]) -> Result<Self, ParseCidrError> {
        let cidrs = cidrs
            .iter()
            .map(|raw| {
                let err = |reason: String| ParseCidrError {
                    input: (*raw).to_owned(),
                    reason,
                };
                let net: Ipv4Network = raw.trim().parse().map_err(|e| err(format!("{e}")))?;
                Ipv4Net::new(net.network(), net.prefix()).map_err(|e| err(format!("{e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { id, cidrs })
    }
}

/// Whether the source of CIDR sets has delivered its full state.
pub trait SyncChecker: Send + Sync {
    fn is_synced(&self) -> bool;
}

impl<F> SyncChecker for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_synced(&self) -> bool {
        self()
    }
}

/// Write side of the world-CIDR cache as the manager uses it.
pub trait WorldCidrStore: Send + Sync {
    fn entries(&self) -> Vec<Ipv4Net>;
    fn insert(&self, cidr: Ipv4Net) -> Result<(), Error>;
    fn remove(&self, cidr: Ipv4Net) -> Result<bool, Error>;
}

impl WorldCidrStore for WorldCidrCache {
    fn entries(&self) -> Vec<Ipv4Net> {
        WorldCidrCache::entries(self)
    }

    fn insert(&self, cidr: Ipv4Net) -> Result<(), Error> {
        WorldCidrCache::insert(self, cidr)
    }

    fn remove(&self, cidr: Ipv4Net) -> Result<bool, Error> {
        WorldCidrCache::remove(self, cidr)
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// False when the pass was skipped because the source is not synced yet.
    pub synced: bool,
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct WorldCidrsManager<S: WorldCidrStore = WorldCidrCache> {
    store: Arc<S>,
    checker: Box<dyn SyncChecker>,
    sets: Mutex<HashMap<CidrSetId, CidrSet>>,
}

impl<S: WorldCidrStore> WorldCidrsManager<S> {
    pub fn new(store: Arc<S>, checker: impl SyncChecker + 'static) -> Self {
        Self {
            store,
            checker: Box::new(checker),
            sets: Mutex::new(HashMap::new()),
        }
    }

    fn lock_sets(&self) -> MutexGuard<'_, HashMap<CidrSetId, CidrSet>> {
        // the map is never left half-updated, so a poisoned lock is still usable
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_add_cidr_set(&self, set: CidrSet) -> ReconcileReport {
        let mut sets = self.lock_sets();
        let id = set.id.clone();
        if sets.insert(id.clone(), set).is_some() {
            info!("world CIDR set {id} updated");
        } else {
            info!("world CIDR set {id} added");
        }
        self.reconcile_locked(&sets)
    }

    /// Returns `None` if the set was never added.
    pub fn on_delete_cidr_set(&self, id: &CidrSetId) -> Option<ReconcileReport> {
        let mut sets = self.lock_sets();
        if sets.remove(id).is_none() {
            warn!("can't delete world CIDR set {id}: set not found");
            return None;
        }
        info!("world CIDR set {id} deleted");
        Some(self.reconcile_locked(&sets))
    }

    pub fn reconcile(&self) -> ReconcileReport {
        let sets = self.lock_sets();
        self.reconcile_locked(&sets)
    }

    /// Union of every set's ranges, host bits dropped.
    pub fn desired_cidrs(&self) -> BTreeSet<Ipv4Net> {
        Self::desired(&self.lock_sets())
    }

    pub fn cidr_set(&self, id: &CidrSetId) -> Option<CidrSet> {
        self.lock_sets().get(id).cloned()
    }

    pub fn is_synced(&self) -> bool {
        self.checker.is_synced()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn desired(sets: &HashMap<CidrSetId, CidrSet>) -> BTreeSet<Ipv4Net> {
        sets.values()
            .flat_map(|s| s.cidrs.iter().map(Ipv4Net::trunc))
            .collect()
    }

    // Must run with the set map locked so passes never interleave.
    fn reconcile_locked(&self, sets: &HashMap<CidrSetId, CidrSet>) -> ReconcileReport {
        if !self.checker.is_synced() {
            debug!("reconcile skipped: CIDR sets not synced yet");
            return ReconcileReport::default();
        }
        let desired = Self::desired(sets);
        let mut report = ReconcileReport {
            synced: true,
            ..ReconcileReport::default()
        };

        // Adding before removing keeps a range that moves between sets
        // reachable throughout.
        let present: BTreeSet<Ipv4Net> = self.store.entries().into_iter().collect();
        for cidr in desired.difference(&present) {
            match self.store.insert(*cidr) {
                Ok(()) => {
                    info!("world CIDR {cidr} added");
                    report.added += 1;
                }
                Err(e) => {
                    error!("error adding world CIDR {cidr}: {e}");
                    report.failed += 1;
                }
            }
        }

        let present: BTreeSet<Ipv4Net> = self.store.entries().into_iter().collect();
        for cidr in present.difference(&desired) {
            match self.store.remove(*cidr) {
                Ok(_) => {
                    info!("world CIDR {cidr} removed");
                    report.removed += 1;
                }
                Err(e) => {
                    error!("error removing world CIDR {cidr}: {e}");
                    report.failed += 1;
                }
            }
        }

        counter!("hsipcache_reconcile_runs_total").increment(1);
        counter!("hsipcache_reconcile_added_total").increment(report.added as u64);
        counter!("hsipcache_reconcile_removed_total").increment(report.removed as u64);
        counter!("hsipcache_reconcile_failed_total").increment(report.failed as u64);
        debug!("reconcile: {report:?}");
        report
    }
}

impl<S: WorldCidrStore + 'static> WorldCidrsManager<S> {
    /// Wait in the background for the source to sync, then run the first
    /// reconciliation.
    pub fn run_reconciliation_after_sync(self: &Arc<Self>, poll: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        thread::spawn(move || {
            while !manager.checker.is_synced() {
                thread::sleep(poll);
            }
            let report = manager.reconcile();
            info!(
                "initial world CIDR reconciliation: added={} removed={} failed={}",
                report.added, report.removed, report.failed
            );
        })
    }
}
