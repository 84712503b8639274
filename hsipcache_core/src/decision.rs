//! Encapsulation decision for outbound IPv4 packets.
//!
//! Three checks run in a fixed order and the first one that applies wins:
//! transparent mode, local endpoint (only without per-endpoint routes), then
//! world-CIDR membership. Whatever is left belongs to a remote node and gets
//! tunneled to that node's address.

use crate::config::DatapathConfig;
use crate::endpoints::EndpointMap;
use crate::errors::Error;
use crate::world_cidrs::WorldCidrCache;
use log::info;
use metrics::gauge;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// World-routable ranges, as seen by the datapath.
pub trait WorldCidrLookup {
    fn is_world(&self, addr: u32) -> bool;

    /// Resolution the lookup truncates addresses to, if fixed by the source.
    fn lookup_depth(&self) -> Option<u8> {
        None
    }
}

/// Workloads hosted on this node.
pub trait EndpointLookup {
    fn is_local_endpoint(&self, addr: u32) -> bool;
}

impl WorldCidrLookup for WorldCidrCache {
    #[inline]
    fn is_world(&self, addr: u32) -> bool {
        self.lookup4(addr)
    }

    fn lookup_depth(&self) -> Option<u8> {
        Some(self.cache_key_depth())
    }
}

impl EndpointLookup for EndpointMap {
    #[inline]
    fn is_local_endpoint(&self, addr: u32) -> bool {
        self.lookup(addr)
    }
}

impl<T: WorldCidrLookup + ?Sized> WorldCidrLookup for &T {
    #[inline]
    fn is_world(&self, addr: u32) -> bool {
        (**self).is_world(addr)
    }

    fn lookup_depth(&self) -> Option<u8> {
        (**self).lookup_depth()
    }
}

impl<T: WorldCidrLookup + ?Sized> WorldCidrLookup for Arc<T> {
    #[inline]
    fn is_world(&self, addr: u32) -> bool {
        (**self).is_world(addr)
    }

    fn lookup_depth(&self) -> Option<u8> {
        (**self).lookup_depth()
    }
}

impl<T: EndpointLookup + ?Sized> EndpointLookup for &T {
    #[inline]
    fn is_local_endpoint(&self, addr: u32) -> bool {
        (**self).is_local_endpoint(addr)
    }
}

impl<T: EndpointLookup + ?Sized> EndpointLookup for Arc<T> {
    #[inline]
    fn is_local_endpoint(&self, addr: u32) -> bool {
        (**self).is_local_endpoint(addr)
    }
}

/// Which check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    NoEncapsulationMode,
    LocalEndpoint,
    World,
    Remote,
}

impl Verdict {
    pub const ALL: [Verdict; 4] = [
        Verdict::NoEncapsulationMode,
        Verdict::LocalEndpoint,
        Verdict::World,
        Verdict::Remote,
    ];

    #[inline]
    pub const fn needs_encapsulation(self) -> bool {
        matches!(self, Verdict::Remote)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Verdict::NoEncapsulationMode => "no_encapsulation",
            Verdict::LocalEndpoint => "local_endpoint",
            Verdict::World => "world",
            Verdict::Remote => "remote",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Per-verdict tallies, bumped with relaxed atomics.
#[derive(Debug, Default)]
pub struct DecisionStats {
    counts: [AtomicU64; 4],
}

impl DecisionStats {
    #[inline]
    pub fn record(&self, verdict: Verdict) {
        self.counts[verdict.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, verdict: Verdict) -> u64 {
        self.counts[verdict.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        Verdict::ALL.iter().map(|v| self.get(*v)).sum()
    }
}

pub struct EncapClassifier<W, E> {
    cfg: DatapathConfig,
    world: W,
    endpoints: E,
    stats: DecisionStats,
}

impl<W: WorldCidrLookup, E: EndpointLookup> EncapClassifier<W, E> {
    /// Fails if `cfg` is invalid or asks for a depth the world source
    /// does not resolve.
    pub fn new(cfg: DatapathConfig, world: W, endpoints: E) -> Result<Self, Error> {
        cfg.validate()?;
        if let Some(depth) = world.lookup_depth() {
            if depth != cfg.cache_key_depth {
                return Err(Error::InvalidConfig(format!(
                    "cache_key_depth /{} does not match the world cache depth /{depth}",
                    cfg.cache_key_depth
                )));
            }
        }
        info!(
            "encap classifier: no_encapsulation={} endpoint_routing={} cache_key_depth={}",
            cfg.no_encapsulation, cfg.endpoint_routing, cfg.cache_key_depth
        );
        Ok(Self {
            cfg,
            world,
            endpoints,
            stats: DecisionStats::default(),
        })
    }

    /// Decide for destination `addr` (host order). No side effects.
    #[inline]
    pub fn classify(&self, addr: u32) -> Verdict {
        if self.cfg.no_encapsulation {
            return Verdict::NoEncapsulationMode;
        }
        // With endpoint routes, local traffic never gets this far.
        if !self.cfg.endpoint_routing && self.endpoints.is_local_endpoint(addr) {
            return Verdict::LocalEndpoint;
        }
        // Not a world range: assume a remote node's workload and tunnel to it.
        if self.world.is_world(addr) {
            Verdict::World
        } else {
            Verdict::Remote
        }
    }

    #[inline]
    pub fn needs_encapsulation(&self, addr: u32) -> bool {
        self.classify(addr).needs_encapsulation()
    }

    #[inline]
    pub fn needs_encapsulation_ip(&self, addr: Ipv4Addr) -> bool {
        self.needs_encapsulation(u32::from(addr))
    }

    /// [`EncapClassifier::needs_encapsulation`] that also tallies the verdict.
    #[inline]
    pub fn needs_encapsulation_counted(&self, addr: u32) -> bool {
        let verdict = self.classify(addr);
        self.stats.record(verdict);
        verdict.needs_encapsulation()
    }

    pub fn config(&self) -> &DatapathConfig {
        &self.cfg
    }

    pub fn stats(&self) -> &DecisionStats {
        &self.stats
    }

    /// Publish the tallies (caller decides cadence).
    pub fn report_metrics(&self) {
        for verdict in Verdict::ALL {
            gauge!("hsipcache_decisions", "verdict" => verdict.as_str())
                .set(self.stats.get(verdict) as f64);
        }
    }
}
