use hsipcache_agent::{
    CidrSet, CidrSetId, ReconcileReport, WorldCidrStore, WorldCidrsManager,
};
use hsipcache_core::{Error, WorldCidrCache};
use ipnet::Ipv4Net;
use proptest::collection::{btree_set, vec as pvec};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn unique(tag: &str) -> String {
    format!("test_agent_{tag}_{}_{}", std::process::id(), rand::random::<u32>())
}

fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

fn id(name: &str) -> CidrSetId {
    CidrSetId::new("kube-system", name)
}

fn cache(tag: &str) -> Arc<WorldCidrCache> {
    Arc::new(WorldCidrCache::open(&unique(tag), 256, 16).unwrap())
}

fn synced() -> impl Fn() -> bool + Send + Sync {
    || true
}

#[test]
fn parse_accepts_cidrs_and_bare_addresses() {
    let set = CidrSet::parse(id("a"), &["8.8.4.4/16", " 1.1.1.1 ", "0.0.0.0/0"]).unwrap();
    assert_eq!(set.cidrs, vec![net("8.8.0.0/16"), net("1.1.1.1/32"), net("0.0.0.0/0")]);
    assert_eq!(set.id.to_string(), "kube-system/a");
}

#[test]
fn parse_rejects_garbage_and_ipv6() {
    let err = CidrSet::parse(id("bad"), &["10.0.0.0/8", "10.0.0.0/33"]).unwrap_err();
    assert_eq!(err.input, "10.0.0.0/33");
    assert!(CidrSet::parse(id("bad"), &["2001:db8::/32"]).is_err());
    assert!(CidrSet::parse(id("bad"), &["world"]).is_err());
}

#[test]
fn add_update_delete_drive_the_cache() {
    let cache = cache("lifecycle");
    let manager = WorldCidrsManager::new(Arc::clone(&cache), synced());

    let r = manager.on_add_cidr_set(CidrSet::parse(id("a"), &["8.8.0.0/16", "1.0.0.0/8"]).unwrap());
    assert_eq!(r, ReconcileReport { synced: true, added: 2, removed: 0, failed: 0 });
    assert!(cache.lookup4(u32::from(net("8.8.8.8/32").addr())));

    // update replaces the set's contents
    let r = manager.on_add_cidr_set(CidrSet::parse(id("a"), &["1.0.0.0/8", "9.9.0.0/16"]).unwrap());
    assert_eq!((r.added, r.removed), (1, 1));
    assert_eq!(cache.entries(), vec![net("1.0.0.0/8"), net("9.9.0.0/16")]);

    let r = manager.on_delete_cidr_set(&id("a")).unwrap();
    assert_eq!((r.added, r.removed), (0, 2));
    assert!(cache.is_empty());
}

#[test]
fn deleting_an_unknown_set_does_nothing() {
    let cache = cache("unknown");
    cache.insert(net("5.5.0.0/16")).unwrap();
    let manager = WorldCidrsManager::new(Arc::clone(&cache), synced());
    assert!(manager.on_delete_cidr_set(&id("ghost")).is_none());
    // no reconcile ran, so the stray entry survives
    assert!(cache.contains(net("5.5.0.0/16")));
}

#[test]
fn shared_ranges_survive_one_set_going_away() {
    let cache = cache("shared");
    let manager = WorldCidrsManager::new(Arc::clone(&cache), synced());
    manager.on_add_cidr_set(CidrSet::parse(id("a"), &["8.8.0.0/16"]).unwrap());
    manager.on_add_cidr_set(CidrSet::parse(id("b"), &["8.8.0.0/16", "4.4.0.0/16"]).unwrap());
    manager.on_delete_cidr_set(&id("a")).unwrap();
    assert_eq!(cache.entries(), vec![net("4.4.0.0/16"), net("8.8.0.0/16")]);
}

#[test]
fn nothing_is_written_before_sync() {
    let cache = cache("unsynced");
    cache.insert(net("5.5.0.0/16")).unwrap();
    let ready = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ready);
    let manager = WorldCidrsManager::new(Arc::clone(&cache), move || flag.load(Ordering::Acquire));

    let r = manager.on_add_cidr_set(CidrSet::parse(id("a"), &["8.8.0.0/16"]).unwrap());
    assert_eq!(r, ReconcileReport::default());
    assert_eq!(cache.entries(), vec![net("5.5.0.0/16")]);

    ready.store(true, Ordering::Release);
    let r = manager.reconcile();
    assert_eq!((r.added, r.removed), (1, 1));
    assert_eq!(cache.entries(), vec![net("8.8.0.0/16")]);
}

#[test]
fn background_reconciliation_waits_for_sync() {
    let cache = cache("background");
    let ready = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ready);
    let manager = Arc::new(WorldCidrsManager::new(Arc::clone(&cache), move || {
        flag.load(Ordering::Acquire)
    }));
    manager.on_add_cidr_set(CidrSet::parse(id("a"), &["100.64.0.0/10"]).unwrap());

    let handle = manager.run_reconciliation_after_sync(Duration::from_millis(5));
    std::thread::sleep(Duration::from_millis(30));
    assert!(cache.is_empty());

    ready.store(true, Ordering::Release);
    handle.join().unwrap();
    assert!(cache.contains(net("100.64.0.0/10")));
}

/// Records every write and fails on demand.
#[derive(Default)]
struct RecordingStore {
    entries: Mutex<BTreeSet<Ipv4Net>>,
    log: Mutex<Vec<(char, Ipv4Net)>>,
    reject: Option<Ipv4Net>,
}

impl WorldCidrStore for RecordingStore {
    fn entries(&self) -> Vec<Ipv4Net> {
        self.entries.lock().unwrap().iter().copied().collect()
    }

    fn insert(&self, cidr: Ipv4Net) -> Result<(), Error> {
        if self.reject == Some(cidr) {
            return Err(Error::CapacityExceeded);
        }
        self.log.lock().unwrap().push(('+', cidr));
        self.entries.lock().unwrap().insert(cidr);
        Ok(())
    }

    fn remove(&self, cidr: Ipv4Net) -> Result<bool, Error> {
        self.log.lock().unwrap().push(('-', cidr));
        Ok(self.entries.lock().unwrap().remove(&cidr))
    }
}

#[test]
fn adds_happen_before_removes() {
    let store = Arc::new(RecordingStore::default());
    store.entries.lock().unwrap().extend([net("1.0.0.0/8"), net("2.0.0.0/8")]);
    let manager = WorldCidrsManager::new(Arc::clone(&store), synced());

    manager.on_add_cidr_set(CidrSet::parse(id("a"), &["3.0.0.0/8", "4.0.0.0/8"]).unwrap());
    let log = store.log.lock().unwrap().clone();
    let first_remove = log.iter().position(|(op, _)| *op == '-').unwrap();
    assert!(log[..first_remove].iter().all(|(op, _)| *op == '+'));
    assert!(log[first_remove..].iter().all(|(op, _)| *op == '-'));
    assert_eq!(log.len(), 4);
}

#[test]
fn a_failed_entry_does_not_stop_the_pass() {
    let store = Arc::new(RecordingStore {
        reject: Some(net("3.0.0.0/8")),
        ..RecordingStore::default()
    });
    store.entries.lock().unwrap().insert(net("1.0.0.0/8"));
    let manager = WorldCidrsManager::new(Arc::clone(&store), synced());

    let r = manager.on_add_cidr_set(CidrSet::parse(id("a"), &["3.0.0.0/8", "4.0.0.0/8"]).unwrap());
    assert_eq!(r, ReconcileReport { synced: true, added: 1, removed: 1, failed: 1 });
    assert_eq!(store.entries(), vec![net("4.0.0.0/8")]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn reconcile_converges_to_union(
        initial in btree_set((any::<u32>(), 0u8..=16), 0..6),
        sets in pvec(pvec((any::<u32>(), 0u8..=16), 0..5), 1..4),
    ) {
        let to_net = |(a, p): (u32, u8)| Ipv4Net::new(a.into(), p).unwrap().trunc();
        let cache = cache("prop");
        for n in initial.into_iter().map(to_net) {
            cache.insert(n).unwrap();
        }
        let manager = WorldCidrsManager::new(Arc::clone(&cache), synced());
        let mut union = BTreeSet::new();
        for (i, set) in sets.into_iter().enumerate() {
            let cidrs: Vec<Ipv4Net> = set.into_iter().map(to_net).collect();
            union.extend(cidrs.iter().copied());
            manager.on_add_cidr_set(CidrSet::new(id(&format!("s{i}")), cidrs));
        }
        let got: BTreeSet<Ipv4Net> = cache.entries().into_iter().collect();
        prop_assert_eq!(&got, &union);
        prop_assert_eq!(manager.desired_cidrs(), union);
        // a second pass has nothing left to do
        let again = manager.reconcile();
        prop_assert_eq!((again.added, again.removed, again.failed), (0, 0, 0));
    }
}
