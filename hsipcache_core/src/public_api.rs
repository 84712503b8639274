//! C ABI over the world-CIDR cache, the endpoint map and the classifier.
//!
//! Objects are addressed by [`HandleId`]s from the handle registry, never by
//! raw pointers. Addresses on the lookup calls are IPv4 in host byte order.
//! Every call returns an [`ErrorCode`] and records it for `hsip_last_error`.

use crate::{
    config::DatapathConfig,
    errors::{map_error, set_last_error, ErrorCode},
    handle_registry::{HandleId, CLASSIFIERS, ENDPOINT_MAPS, WORLD_CACHES},
    EncapClassifier, EndpointMap, LpmTrie, WorldCidrCache,
};
use ipnet::Ipv4Net;
use log::{debug, warn};
use std::{ffi::CStr, net::Ipv4Addr, os::raw::c_char};

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::Utf8Error);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

/// "a.b.c.d/n", or a bare address taken as a /32.
#[inline]
fn parse_cidr(s: &str) -> Result<Ipv4Net, ErrorCode> {
    let s = s.trim();
    if let Ok(net) = s.parse::<Ipv4Net>() {
        Ok(net)
    } else if let Ok(ip) = s.parse::<Ipv4Addr>() {
        Ok(Ipv4Net::from(ip))
    } else {
        Err(ErrorCode::InvalidPrefix)
    }
}

#[inline]
fn parse_addr(s: &str) -> Result<Ipv4Addr, ErrorCode> {
    s.trim().parse().map_err(|_| ErrorCode::InvalidPrefix)
}

/// Record `code` as the thread's last error and hand it back.
#[inline]
fn report(code: ErrorCode) -> ErrorCode {
    set_last_error(code);
    code
}

#[inline]
fn finish(r: Result<(), ErrorCode>) -> ErrorCode {
    report(r.err().unwrap_or(ErrorCode::Success))
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => return report(e),
}}}

/// Write through an out-pointer the caller owns.
macro_rules! out_ptr { ($ptr:expr) => {
    match unsafe { $ptr.as_mut() } {
        Some(slot) => slot,
        None => return report(ErrorCode::InvalidHandle),
    }
}}

// ───────────────────────── world-CIDR cache ──────────────────────────── //

/// Open (or create) a world-CIDR cache region.
/// `cache_key_depth` is the lookup resolution in address bits (1..=32).
#[no_mangle]
pub extern "C" fn hsip_world_open(
    name_utf8: *const c_char,
    capacity: usize,
    cache_key_depth: u8,
    out: *mut HandleId,
) -> ErrorCode {
    let out = out_ptr!(out);
    let name = try_c!(cstr(name_utf8));
    let cache = try_c!(WorldCidrCache::open(name, capacity, cache_key_depth).map_err(|e| map_error(&e)));
    *out = WORLD_CACHES.register(cache);
    debug!("hsip_world_open({name}) -> handle {}", *out);
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn hsip_world_close(h: HandleId) -> ErrorCode {
    finish(WORLD_CACHES.unregister(h))
}

#[no_mangle]
pub extern "C" fn hsip_world_insert(h: HandleId, cidr_utf8: *const c_char) -> ErrorCode {
    let cache = try_c!(WORLD_CACHES.get(h));
    let net = try_c!(cstr(cidr_utf8).and_then(parse_cidr));
    finish(cache.insert(net).map_err(|e| map_error(&e)))
}

/// `NotFound` when the range was not stored.
#[no_mangle]
pub extern "C" fn hsip_world_remove(h: HandleId, cidr_utf8: *const c_char) -> ErrorCode {
    let cache = try_c!(WORLD_CACHES.get(h));
    let net = try_c!(cstr(cidr_utf8).and_then(parse_cidr));
    match cache.remove(net) {
        Ok(true) => report(ErrorCode::Success),
        Ok(false) => report(ErrorCode::NotFound),
        Err(e) => report(map_error(&e)),
    }
}

#[no_mangle]
pub extern "C" fn hsip_world_lookup(h: HandleId, addr: u32, out_found: *mut bool) -> ErrorCode {
    let out = out_ptr!(out_found);
    let cache = try_c!(WORLD_CACHES.get(h));
    *out = cache.lookup4(addr);
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn hsip_world_len(h: HandleId, out: *mut u64) -> ErrorCode {
    let out = out_ptr!(out);
    let cache = try_c!(WORLD_CACHES.get(h));
    *out = cache.len() as u64;
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn hsip_world_clear(h: HandleId) -> ErrorCode {
    let cache = try_c!(WORLD_CACHES.get(h));
    finish(cache.clear().map_err(|e| map_error(&e)))
}

// ───────────────────────── endpoint map ──────────────────────────────── //

#[no_mangle]
pub extern "C" fn hsip_endpoints_open(
    name_utf8: *const c_char,
    capacity: usize,
    out: *mut HandleId,
) -> ErrorCode {
    let out = out_ptr!(out);
    let name = try_c!(cstr(name_utf8));
    let map = try_c!(EndpointMap::open(name, capacity).map_err(|e| map_error(&e)));
    *out = ENDPOINT_MAPS.register(map);
    debug!("hsip_endpoints_open({name}) -> handle {}", *out);
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn hsip_endpoints_close(h: HandleId) -> ErrorCode {
    finish(ENDPOINT_MAPS.unregister(h))
}

#[no_mangle]
pub extern "C" fn hsip_endpoints_insert(h: HandleId, addr_utf8: *const c_char) -> ErrorCode {
    let map = try_c!(ENDPOINT_MAPS.get(h));
    let addr = try_c!(cstr(addr_utf8).and_then(parse_addr));
    finish(map.insert(addr).map_err(|e| map_error(&e)))
}

#[no_mangle]
pub extern "C" fn hsip_endpoints_remove(h: HandleId, addr_utf8: *const c_char) -> ErrorCode {
    let map = try_c!(ENDPOINT_MAPS.get(h));
    let addr = try_c!(cstr(addr_utf8).and_then(parse_addr));
    match map.remove(addr) {
        Ok(true) => report(ErrorCode::Success),
        Ok(false) => report(ErrorCode::NotFound),
        Err(e) => report(map_error(&e)),
    }
}

#[no_mangle]
pub extern "C" fn hsip_endpoints_lookup(h: HandleId, addr: u32, out_found: *mut bool) -> ErrorCode {
    let out = out_ptr!(out_found);
    let map = try_c!(ENDPOINT_MAPS.get(h));
    *out = map.lookup(addr);
    report(ErrorCode::Success)
}

// ───────────────────────── classifier ────────────────────────────────── //

/// Build a classifier over two open handles. The lookup depth is taken from
/// the world cache. Both handles may be closed afterwards; the classifier
/// keeps its own references.
#[no_mangle]
pub extern "C" fn hsip_classifier_new(
    world: HandleId,
    endpoints: HandleId,
    no_encapsulation: bool,
    endpoint_routing: bool,
    out: *mut HandleId,
) -> ErrorCode {
    let out = out_ptr!(out);
    let world = try_c!(WORLD_CACHES.get(world));
    let endpoints = try_c!(ENDPOINT_MAPS.get(endpoints));
    let cfg = DatapathConfig {
        no_encapsulation,
        endpoint_routing,
        cache_key_depth: world.cache_key_depth(),
    };
    let classifier = try_c!(EncapClassifier::new(cfg, world, endpoints).map_err(|e| map_error(&e)));
    *out = CLASSIFIERS.register(classifier);
    report(ErrorCode::Success)
}

/// Same as `hsip_classifier_new`, with the flags read from `HSIPCACHE_*`.
#[no_mangle]
pub extern "C" fn hsip_classifier_from_env(
    world: HandleId,
    endpoints: HandleId,
    out: *mut HandleId,
) -> ErrorCode {
    let out = out_ptr!(out);
    let world = try_c!(WORLD_CACHES.get(world));
    let endpoints = try_c!(ENDPOINT_MAPS.get(endpoints));
    let mut cfg = try_c!(DatapathConfig::from_env().map_err(|e| map_error(&e)));
    if cfg.cache_key_depth != world.cache_key_depth() {
        warn!(
            "ignoring depth /{} from the environment, the cache resolves /{}",
            cfg.cache_key_depth,
            world.cache_key_depth()
        );
    }
    cfg.cache_key_depth = world.cache_key_depth();
    let classifier = try_c!(EncapClassifier::new(cfg, world, endpoints).map_err(|e| map_error(&e)));
    *out = CLASSIFIERS.register(classifier);
    report(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn hsip_classifier_free(h: HandleId) -> ErrorCode {
    finish(CLASSIFIERS.unregister(h))
}

/// `*out = true` when a packet to `addr` must be tunneled.
#[no_mangle]
pub extern "C" fn hsip_needs_encapsulation(h: HandleId, addr: u32, out: *mut bool) -> ErrorCode {
    let out = out_ptr!(out);
    let classifier = try_c!(CLASSIFIERS.get(h));
    *out = classifier.needs_encapsulation_counted(addr);
    report(ErrorCode::Success)
}

/// Push decision tallies and capacity gauges to the stats callback.
#[no_mangle]
pub extern "C" fn hsip_classifier_report_metrics(h: HandleId) -> ErrorCode {
    let classifier = try_c!(CLASSIFIERS.get(h));
    classifier.report_metrics();
    report(ErrorCode::Success)
}

// ───────────────────── maintenance ───────────────────────────────────── //

#[no_mangle]
pub extern "C" fn hsip_world_available_capacity(h: HandleId, out: *mut u64) -> ErrorCode {
    let out = out_ptr!(out);
    let cache = try_c!(WORLD_CACHES.get(h));
    *out = cache.available_capacity() as u64;
    report(ErrorCode::Success)
}

/// Reclaim retired nodes now instead of on the next allocation miss.
#[no_mangle]
pub extern "C" fn hsip_world_flush(h: HandleId) -> ErrorCode {
    let cache = try_c!(WORLD_CACHES.get(h));
    cache.trie().flush();
    cache.trie().report_capacity_metrics();
    report(ErrorCode::Success)
}

/// Unlink a region by name, e.g. after a crashed writer.
#[no_mangle]
pub extern "C" fn hsip_force_destroy(name_utf8: *const c_char) -> ErrorCode {
    let name = try_c!(cstr(name_utf8));
    LpmTrie::destroy(name);
    report(ErrorCode::Success)
}
