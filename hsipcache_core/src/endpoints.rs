//! Local endpoint index: addresses of workloads hosted on this node.
//!
//! Entries are host routes in their own trie region, so the agent that
//! manages endpoints and the datapath readers share them the same way the
//! world-CIDR cache is shared.

use crate::constants::{AF_INET, DEFAULT_CAPACITY};
use crate::errors::Error;
use crate::types::LpmTrie;
use log::debug;
use std::net::Ipv4Addr;

pub const ENDPOINTS_MAP: &str = "endpoints4";

/// Full-length match on family + address.
const HOST_PREFIX_LEN: u8 = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointKey4 {
    pub family: u8,
    pub _pad: [u8; 3],
    pub ip: u32,
}

impl EndpointKey4 {
    pub const fn new(ip: u32) -> Self {
        Self {
            family: AF_INET,
            _pad: [0; 3],
            ip,
        }
    }

    #[inline]
    pub const fn trie_key(&self) -> u64 {
        ((self.family as u64) << 56) | self.ip as u64
    }
}

pub struct EndpointMap {
    trie: LpmTrie,
}

impl EndpointMap {
    pub fn open(name: &str, capacity: usize) -> Result<Self, Error> {
        Ok(Self {
            trie: LpmTrie::open(name, capacity)?,
        })
    }

    pub fn open_default() -> Result<Self, Error> {
        Self::open(ENDPOINTS_MAP, DEFAULT_CAPACITY)
    }

    /// Whether `addr` belongs to a workload on this node.
    #[inline]
    pub fn lookup(&self, addr: u32) -> bool {
        self.trie
            .lookup(EndpointKey4::new(addr).trie_key(), HOST_PREFIX_LEN)
            .is_some_and(|m| m.prefix_len == HOST_PREFIX_LEN)
    }

    pub fn insert(&self, addr: Ipv4Addr) -> Result<(), Error> {
        debug!("local endpoint {addr} added");
        self.trie
            .insert(EndpointKey4::new(u32::from(addr)).trie_key(), HOST_PREFIX_LEN)
    }

    pub fn remove(&self, addr: Ipv4Addr) -> Result<bool, Error> {
        let removed = self
            .trie
            .remove(EndpointKey4::new(u32::from(addr)).trie_key(), HOST_PREFIX_LEN)?;
        if removed {
            debug!("local endpoint {addr} removed");
        }
        Ok(removed)
    }

    pub fn entries(&self) -> Vec<Ipv4Addr> {
        self.trie
            .entries()
            .into_iter()
            .filter(|m| m.prefix_len == HOST_PREFIX_LEN && (m.key >> 56) as u8 == AF_INET)
            .map(|m| Ipv4Addr::from(m.key as u32))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    pub fn trie(&self) -> &LpmTrie {
        &self.trie
    }
}
