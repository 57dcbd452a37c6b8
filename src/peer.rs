//! Peer table (C2): per-destination state, never evicted once inserted.
//!
//! Grounded on the teacher's `rpc::Context` (an `RwLock`-guarded lookup
//! table, insertion under a single writer lock) and on
//! `examples/original_source/homa_impl.h`'s `struct homa_peer` /
//! `struct homa_peertab`.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::error::TransportError;

/// An opaque, substrate-owned route to a peer. The real implementation
/// would hold whatever the IP stack needs to transmit without a fresh
/// route lookup each time; this crate only needs the handle to exist and
/// be droppable.
#[derive(Debug, Clone)]
pub struct RouteHandle {
    pub addr: Ipv4Addr,
}

/// Per-destination state. Never removed from the table once created —
/// pointers into the table (here, `Arc<Peer>`) are long-lived.
#[derive(Debug)]
pub struct Peer {
    pub addr: Ipv4Addr,
    pub route: RouteHandle,
    /// Priorities to use for unscheduled packets sent to this peer, most
    /// recently advertised via a CUTOFFS packet.
    pub unsched_cutoffs: RwLock<Vec<u32>>,
    pub cutoff_version: AtomicU32,
    pub last_resend_tick: AtomicU32,
}

impl Peer {
    fn new(addr: Ipv4Addr, route: RouteHandle, config: &Config) -> Self {
        Peer {
            addr,
            route,
            unsched_cutoffs: RwLock::new(config.unsched_cutoffs.clone()),
            cutoff_version: AtomicU32::new(0),
            last_resend_tick: AtomicU32::new(0),
        }
    }
}

/// Resolves a route for a newly seen peer address. In production this
/// would consult the kernel routing table; here it's a trivial
/// accept-everything resolver, matching this crate's stance that real
/// IP plumbing is an external collaborator (§1).
fn resolve_route(addr: Ipv4Addr) -> Result<RouteHandle, TransportError> {
    if addr.is_unspecified() {
        return Err(TransportError::RouteFailure { addr });
    }
    Ok(RouteHandle { addr })
}

#[derive(Debug, Default)]
pub struct PeerTable {
    inner: RwLock<HashMap<Ipv4Addr, Arc<Peer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable::default()
    }

    /// Returns the peer for `addr`, creating and inserting one if this is
    /// the first time it's been seen. Lookup is lock-free in spirit (a
    /// shared read lock); insertion takes the single writer lock.
    pub fn find(&self, addr: Ipv4Addr, config: &Config) -> Result<Arc<Peer>, TransportError> {
        if let Some(peer) = self.inner.read().expect("peer table poisoned").get(&addr) {
            return Ok(peer.clone());
        }
        let route = resolve_route(addr)?;
        let mut guard = self.inner.write().expect("peer table poisoned");
        // Re-check: another writer may have inserted while we resolved the route.
        if let Some(peer) = guard.get(&addr) {
            return Ok(peer.clone());
        }
        let peer = Arc::new(Peer::new(addr, route, config));
        guard.insert(addr, peer.clone());
        Ok(peer)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("peer table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Peer {
    /// Resolves the §9 ambiguity on `incoming`'s meaning: consistently the
    /// max of what's been sender-declared, what's been granted, and the
    /// peer's unscheduled-bytes figure for the message in question.
    pub fn resolve_incoming(sender_declared: u32, last_grant_offset: u32, sender_unscheduled: u32) -> u32 {
        sender_declared.max(last_grant_offset).max(sender_unscheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_creates_then_reuses_peer() {
        let config = Config::default();
        let table = PeerTable::new();
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let p1 = table.find(addr, &config).unwrap();
        let p2 = table.find(addr, &config).unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unspecified_address_fails_route_resolution() {
        let config = Config::default();
        let table = PeerTable::new();
        let err = table.find(Ipv4Addr::UNSPECIFIED, &config).unwrap_err();
        assert!(matches!(err, TransportError::RouteFailure { .. }));
    }

    #[test]
    fn resolve_incoming_takes_the_max() {
        assert_eq!(Peer::resolve_incoming(5000, 10000, 2000), 10000);
        assert_eq!(Peer::resolve_incoming(5000, 1000, 9000), 9000);
    }
}
