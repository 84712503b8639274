use hsipcache_core::errors::Error;
use hsipcache_core::helpers::canonical;
use hsipcache_core::types::{LpmTrie, Match};
use proptest::collection::vec as pvec;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn unique(tag: &str) -> String {
    format!("test_trie_{tag}_{}_{}", std::process::id(), rand::random::<u32>())
}

/// Key with `ip` in the top 32 bits, so prefixes up to /32 act like IPv4.
fn k(a: u8, b: u8, c: u8, d: u8) -> u64 {
    (u32::from_be_bytes([a, b, c, d]) as u64) << 32
}

/// Wait until slots retired by this process are back on the freelist.
fn drain_retired(trie: &LpmTrie) {
    for _ in 0..10_000 {
        trie.flush();
        if trie.available_capacity() > 0 {
            return;
        }
        thread::yield_now();
    }
}

#[test]
fn basic_ops() {
    let trie = LpmTrie::open(&unique("basic"), 64).unwrap();
    let key = k(192, 168, 0, 1);
    assert!(trie.lookup(key, 64).is_none());

    trie.insert(key, 32).unwrap();
    assert_eq!(
        trie.lookup(key, 64),
        Some(Match {
            key,
            prefix_len: 32
        })
    );
    assert!(trie.contains(key, 32));
    assert_eq!(trie.len(), 1);

    assert!(trie.remove(key, 32).unwrap());
    assert!(trie.lookup(key, 64).is_none());
    assert!(trie.is_empty());
}

#[test]
fn longest_prefix_wins() {
    let trie = LpmTrie::open(&unique("lpm"), 64).unwrap();
    trie.insert(k(10, 0, 0, 0), 8).unwrap();
    trie.insert(k(10, 1, 0, 0), 16).unwrap();
    trie.insert(k(10, 1, 2, 0), 24).unwrap();

    assert_eq!(trie.lookup(k(10, 1, 2, 3), 64).unwrap().prefix_len, 24);
    assert_eq!(trie.lookup(k(10, 1, 9, 9), 64).unwrap().prefix_len, 16);
    assert_eq!(trie.lookup(k(10, 9, 9, 9), 64).unwrap().prefix_len, 8);
    assert!(trie.lookup(k(11, 0, 0, 0), 64).is_none());
}

#[test]
fn lookup_never_returns_more_specific_than_bound() {
    let trie = LpmTrie::open(&unique("bound"), 64).unwrap();
    trie.insert(k(10, 1, 2, 0), 24).unwrap();
    assert!(trie.lookup(k(10, 1, 2, 3), 16).is_none());
    assert!(trie.lookup(k(10, 1, 2, 3), 23).is_none());
    assert_eq!(trie.lookup(k(10, 1, 2, 3), 24).unwrap().prefix_len, 24);

    trie.insert(k(10, 0, 0, 0), 8).unwrap();
    assert_eq!(trie.lookup(k(10, 1, 2, 3), 16).unwrap().prefix_len, 8);
}

#[test]
fn host_bits_are_ignored() {
    let trie = LpmTrie::open(&unique("canon"), 16).unwrap();
    trie.insert(k(172, 16, 99, 7), 12).unwrap();
    assert!(trie.contains(k(172, 16, 0, 0), 12));
    // same prefix with different host bits is a duplicate
    trie.insert(k(172, 31, 0, 1), 12).unwrap();
    assert_eq!(trie.len(), 1);
    assert_eq!(trie.entries()[0].key, k(172, 16, 0, 0));
}

#[test]
fn fork_and_unfork() {
    let trie = LpmTrie::open(&unique("fork"), 16).unwrap();
    let left = k(0b0000_0000, 0, 0, 0);
    let right = k(0b1000_0000, 0, 0, 0);
    trie.insert(left, 32).unwrap();
    trie.insert(right, 32).unwrap();
    assert!(trie.lookup(left, 64).is_some());
    assert!(trie.lookup(right, 64).is_some());

    assert!(trie.remove(right, 32).unwrap());
    assert!(trie.lookup(right, 64).is_none());
    assert!(trie.lookup(left, 64).is_some());

    assert!(trie.remove(left, 32).unwrap());
    assert!(trie.lookup(left, 64).is_none());
    assert!(trie.is_empty());
}

#[test]
fn branching_node_is_not_an_entry() {
    let trie = LpmTrie::open(&unique("branch"), 16).unwrap();
    // these two fork at /23, leaving an internal node at 10.0.0.0/23
    trie.insert(k(10, 0, 0, 0), 24).unwrap();
    trie.insert(k(10, 0, 1, 0), 24).unwrap();
    assert!(!trie.contains(k(10, 0, 0, 0), 23));
    assert!(!trie.remove(k(10, 0, 0, 0), 23).unwrap());
    assert_eq!(trie.len(), 2);

    // storing exactly at the branching node turns it into an entry
    trie.insert(k(10, 0, 0, 0), 23).unwrap();
    assert!(trie.contains(k(10, 0, 0, 0), 23));
    assert_eq!(trie.len(), 3);
    assert_eq!(trie.lookup(k(10, 0, 1, 200), 64).unwrap().prefix_len, 24);
    assert!(trie.remove(k(10, 0, 1, 0), 24).unwrap());
    assert_eq!(trie.lookup(k(10, 0, 1, 200), 64).unwrap().prefix_len, 23);
}

#[test]
fn insert_above_existing_entry() {
    let trie = LpmTrie::open(&unique("above"), 16).unwrap();
    trie.insert(k(192, 168, 1, 0), 24).unwrap();
    trie.insert(k(192, 168, 0, 0), 16).unwrap();
    assert_eq!(trie.lookup(k(192, 168, 1, 1), 64).unwrap().prefix_len, 24);
    assert_eq!(trie.lookup(k(192, 168, 7, 1), 64).unwrap().prefix_len, 16);
    assert!(trie.remove(k(192, 168, 0, 0), 16).unwrap());
    assert!(trie.lookup(k(192, 168, 7, 1), 64).is_none());
    assert_eq!(trie.lookup(k(192, 168, 1, 1), 64).unwrap().prefix_len, 24);
}

#[test]
fn zero_length_prefix_matches_everything() {
    let trie = LpmTrie::open(&unique("default"), 8).unwrap();
    trie.insert(0, 0).unwrap();
    assert_eq!(trie.lookup(k(1, 2, 3, 4), 64).unwrap().prefix_len, 0);
    assert_eq!(trie.lookup(u64::MAX, 0).unwrap().prefix_len, 0);
}

#[test]
fn rejects_invalid_arguments() {
    assert_eq!(LpmTrie::open(&unique("zero"), 0).err(), Some(Error::ZeroCapacity));
    let trie = LpmTrie::open(&unique("invalid"), 8).unwrap();
    assert_eq!(trie.insert(0, 65), Err(Error::InvalidPrefix));
    assert_eq!(trie.remove(0, 65), Err(Error::InvalidPrefix));
    assert!(!trie.contains(0, 65));
}

#[test]
fn capacity_exceeded_leaves_trie_intact() {
    let trie = LpmTrie::open(&unique("full"), 2).unwrap();
    trie.insert(k(10, 0, 0, 0), 8).unwrap();
    // a sibling needs a leaf and a fork node, only one slot is left
    assert_eq!(trie.insert(k(11, 0, 0, 0), 8), Err(Error::CapacityExceeded));
    assert_eq!(trie.len(), 1);
    assert!(trie.contains(k(10, 0, 0, 0), 8));
    assert!(trie.lookup(k(11, 0, 0, 0), 64).is_none());
    // the leaf claimed by the failed insert is reusable
    trie.insert(k(10, 1, 0, 0), 16).unwrap();
    assert_eq!(trie.len(), 2);
}

#[test]
fn removed_slots_are_reused() {
    let trie = LpmTrie::open(&unique("reuse"), 1).unwrap();
    trie.insert(k(1, 1, 1, 1), 32).unwrap();
    assert!(trie.remove(k(1, 1, 1, 1), 32).unwrap());
    drain_retired(&trie);
    trie.insert(k(2, 2, 2, 2), 32).unwrap();
    assert!(trie.contains(k(2, 2, 2, 2), 32));
    assert!(!trie.contains(k(1, 1, 1, 1), 32));
}

#[test]
fn clear_drops_everything() {
    let trie = LpmTrie::open(&unique("clear"), 32).unwrap();
    for i in 0..10u8 {
        trie.insert(k(10, i, 0, 0), 16).unwrap();
    }
    assert_eq!(trie.len(), 10);
    trie.clear().unwrap();
    assert!(trie.is_empty());
    assert!(trie.entries().is_empty());
    assert!(trie.lookup(k(10, 3, 0, 1), 64).is_none());
    trie.insert(k(10, 3, 0, 0), 16).unwrap();
    assert_eq!(trie.len(), 1);
}

#[test]
fn entries_are_sorted() {
    let trie = LpmTrie::open(&unique("entries"), 32).unwrap();
    trie.insert(k(10, 2, 0, 0), 16).unwrap();
    trie.insert(k(10, 0, 0, 0), 8).unwrap();
    trie.insert(k(10, 1, 0, 0), 16).unwrap();
    let got: Vec<(u64, u8)> = trie.entries().iter().map(|m| (m.key, m.prefix_len)).collect();
    assert_eq!(
        got,
        vec![(k(10, 0, 0, 0), 8), (k(10, 1, 0, 0), 16), (k(10, 2, 0, 0), 16)]
    );
}

#[test]
fn second_handle_sees_writes() {
    let name = unique("shared");
    let writer = LpmTrie::open(&name, 32).unwrap();
    let reader = LpmTrie::open(&name, 32).unwrap();
    writer.insert(k(8, 8, 0, 0), 16).unwrap();
    assert_eq!(reader.lookup(k(8, 8, 8, 8), 64).unwrap().prefix_len, 16);
    assert_eq!(reader.len(), 1);
    assert_eq!(reader.os_id(), writer.os_id());

    // capacity is part of the region's identity
    assert_eq!(LpmTrie::open(&name, 64).err(), Some(Error::HeaderMismatch));
}

/// Reference answer: longest stored prefix of length ≤ `max` covering `key`.
fn model_lookup(model: &BTreeSet<(u64, u8)>, key: u64, max: u8) -> Option<u8> {
    model
        .iter()
        .filter(|(k, p)| *p <= max && canonical(key, *p) == *k)
        .map(|(_, p)| *p)
        .max()
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u8),
    Remove(u64, u8),
}

fn op() -> impl Strategy<Value = Op> {
    // narrow key space so prefixes actually overlap
    let key = (0u64..64).prop_map(|x| x << 58);
    prop_oneof![
        3 => (key.clone(), 0u8..=8).prop_map(|(k, p)| Op::Insert(k, p)),
        1 => (key, 0u8..=8).prop_map(|(k, p)| Op::Remove(k, p)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn agrees_with_reference_model(
        ops in pvec(op(), 1..64),
        queries in pvec((0u64..64, 0u8..=10), 16),
    ) {
        let trie = LpmTrie::open(&unique("prop"), 256).unwrap();
        let mut model = BTreeSet::new();

        for op in &ops {
            match *op {
                Op::Insert(key, plen) => {
                    trie.insert(key, plen).unwrap();
                    model.insert((canonical(key, plen), plen));
                }
                Op::Remove(key, plen) => {
                    let was = model.remove(&(canonical(key, plen), plen));
                    prop_assert_eq!(trie.remove(key, plen).unwrap(), was);
                }
            }
            prop_assert_eq!(trie.len(), model.len());
        }

        for (raw, max) in queries {
            let key = raw << 58;
            prop_assert_eq!(trie.lookup(key, max).map(|m| m.prefix_len), model_lookup(&model, key, max));
        }
        let entries: Vec<(u64, u8)> = trie.entries().iter().map(|m| (m.key, m.prefix_len)).collect();
        let expected: Vec<(u64, u8)> = {
            let mut v: Vec<_> = model.iter().copied().collect();
            v.sort_unstable();
            v
        };
        prop_assert_eq!(entries, expected);
    }
}

#[test]
fn concurrent_readers_never_lose_a_stable_entry() {
    let trie = Arc::new(LpmTrie::open(&unique("stress"), 4096).unwrap());
    let stable = k(100, 64, 0, 0);
    trie.insert(stable, 10).unwrap();

    let readers = num_cpus::get().clamp(2, 8);
    let barrier = Arc::new(Barrier::new(readers + 1));
    let stop = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..readers)
        .map(|i| {
            let trie = Arc::clone(&trie);
            let barrier = Arc::clone(&barrier);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                barrier.wait();
                let target = k(100, 64 + i as u8, 1, 1);
                let mut seen = 0u64;
                loop {
                    let m = trie.lookup(target, 64).expect("stable entry vanished");
                    assert!(m.prefix_len >= 10);
                    seen += 1;
                    if stop.load(Ordering::Relaxed) {
                        break seen;
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    // churn around and below the stable entry
    for round in 0..200u32 {
        let b = (round % 32) as u8;
        trie.insert(k(100, 64 + b % 8, b, 0), 24).unwrap();
        trie.insert(k(101, b, 0, 0), 16).unwrap();
        trie.insert(k(100, 64 + b % 8, 0, 0), 16).unwrap();
        assert!(trie.remove(k(100, 64 + b % 8, b, 0), 24).unwrap());
        assert!(trie.remove(k(101, b, 0, 0), 16).unwrap());
        assert!(trie.remove(k(100, 64 + b % 8, 0, 0), 16).unwrap());
    }
    stop.store(true, Ordering::Relaxed);

    for h in handles {
        assert!(h.join().unwrap() > 0);
    }
    assert_eq!(trie.len(), 1);
    assert!(trie.contains(stable, 10));
}

#[test]
fn reader_handle_sees_whole_nodes_while_slots_are_recycled() {
    let name = unique("recycle");
    // small arena so churn has to go through the freelist
    let writer = LpmTrie::open(&name, 12).unwrap();
    let reader = Arc::new(LpmTrie::open(&name, 12).unwrap());
    writer.insert(k(172, 16, 0, 0), 12).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let reader = Arc::clone(&reader);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let target = k(172, 16, 9, 9);
            let mut seen = 0u64;
            loop {
                let m = reader.lookup(target, 64).expect("stable entry vanished");
                // a torn node would pair one slot's key with another's length
                assert_eq!(m.key, canonical(target, m.prefix_len));
                assert!(m.prefix_len >= 12);
                seen += 1;
                if stop.load(Ordering::Relaxed) {
                    break seen;
                }
            }
        })
    };

    for round in 0..500u32 {
        let b = (round % 16) as u8;
        let nets = [(k(172, 16, b, 0), 24), (k(172, 16 + b % 4, 0, 0), 16), (k(10, b, 0, 0), 16)];
        for &(key, plen) in &nets {
            match writer.insert(key, plen) {
                Ok(()) | Err(Error::CapacityExceeded) => {}
                Err(e) => panic!("insert failed: {e}"),
            }
        }
        for &(key, plen) in &nets {
            writer.remove(key, plen).unwrap();
        }
        drain_retired(&writer);
    }
    stop.store(true, Ordering::Relaxed);

    assert!(handle.join().unwrap() > 0);
    assert_eq!(reader.entries(), vec![Match { key: k(172, 16, 0, 0), prefix_len: 12 }]);
}
