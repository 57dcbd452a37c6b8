//! Per-socket RPC registry (C4): power-of-two bucket hash tables for
//! client and server RPCs, each bucket's mutex doubling as the per-RPC
//! lock (§4.4, §9).
//!
//! A bucket is realized as `Mutex<HashMap<u64, Rpc>>`: the `Rpc` lives
//! directly inside the map under that mutex, so holding the bucket lock
//! *is* holding the RPC lock — there's no separate lock to forget.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::RPC_BUCKETS;
use crate::metrics::Metrics;
use crate::rpc::{Role, Rpc};

pub struct RpcBucket {
    table: Mutex<HashMap<u64, Rpc>>,
}

impl Default for RpcBucket {
    fn default() -> Self {
        RpcBucket { table: Mutex::new(HashMap::new()) }
    }
}

impl RpcBucket {
    /// Runs `f` with exclusive access to the bucket (and, via it, every
    /// `Rpc` the bucket owns). Uses `try_lock` first per the fast-path
    /// policy in §5; a miss is counted and falls back to blocking.
    pub fn with<T>(&self, metrics: &Metrics, f: impl FnOnce(&mut HashMap<u64, Rpc>) -> T) -> T {
        match self.table.try_lock() {
            Ok(mut guard) => f(&mut guard),
            Err(_) => {
                Metrics::incr(&metrics.bucket_lock_misses);
                let mut guard = self.table.lock().expect("rpc bucket poisoned");
                f(&mut guard)
            }
        }
    }
}

/// Two bucket tables — client RPCs (keyed by the id this socket chose)
/// and server RPCs (keyed by the id the peer chose) — per socket.
pub struct RpcRegistry {
    client_buckets: Vec<RpcBucket>,
    server_buckets: Vec<RpcBucket>,
}

impl Default for RpcRegistry {
    fn default() -> Self {
        RpcRegistry {
            client_buckets: (0..RPC_BUCKETS).map(|_| RpcBucket::default()).collect(),
            server_buckets: (0..RPC_BUCKETS).map(|_| RpcBucket::default()).collect(),
        }
    }
}

fn hash(id: u64) -> usize {
    (id as usize) & (RPC_BUCKETS - 1)
}

impl RpcRegistry {
    pub fn new() -> Self {
        RpcRegistry::default()
    }

    pub fn client_bucket(&self, id: u64) -> &RpcBucket {
        &self.client_buckets[hash(id)]
    }

    pub fn server_bucket(&self, id: u64) -> &RpcBucket {
        &self.server_buckets[hash(id)]
    }

    pub fn insert_client(&self, metrics: &Metrics, rpc: Rpc) {
        let id = rpc.id;
        self.client_bucket(id).with(metrics, |table| {
            table.insert(id, rpc);
        });
    }

    pub fn insert_server(&self, metrics: &Metrics, rpc: Rpc) {
        let id = rpc.id;
        self.server_bucket(id).with(metrics, |table| {
            table.insert(id, rpc);
        });
    }

    pub fn with_client<T>(&self, metrics: &Metrics, id: u64, f: impl FnOnce(Option<&mut Rpc>) -> T) -> T {
        self.client_bucket(id).with(metrics, |table| f(table.get_mut(&id)))
    }

    pub fn with_server<T>(&self, metrics: &Metrics, id: u64, f: impl FnOnce(Option<&mut Rpc>) -> T) -> T {
        self.server_bucket(id).with(metrics, |table| f(table.get_mut(&id)))
    }

    /// Dispatches to [`Self::with_client`] or [`Self::with_server`] based
    /// on `role`, so callers that deal with either side of an RPC (grant
    /// and resend handling, which address an RPC by key rather than by
    /// a known role) don't need to duplicate the match themselves.
    pub fn with_role<T>(&self, metrics: &Metrics, role: Role, id: u64, f: impl FnOnce(Option<&mut Rpc>) -> T) -> T {
        match role {
            Role::Client => self.with_client(metrics, id, f),
            Role::Server => self.with_server(metrics, id, f),
        }
    }

    pub fn insert_role(&self, metrics: &Metrics, role: Role, rpc: Rpc) {
        match role {
            Role::Client => self.insert_client(metrics, rpc),
            Role::Server => self.insert_server(metrics, rpc),
        }
    }

    pub fn remove_client(&self, metrics: &Metrics, id: u64) -> Option<Rpc> {
        self.client_bucket(id).with(metrics, |table| table.remove(&id))
    }

    pub fn remove_server(&self, metrics: &Metrics, id: u64) -> Option<Rpc> {
        self.server_bucket(id).with(metrics, |table| table.remove(&id))
    }

    /// Runs `f` over every active (non-dead) RPC in every bucket — used
    /// by the timer's silent-tick scan (§4.9) and by reap.
    pub fn for_each_active(&self, metrics: &Metrics, mut f: impl FnMut(&mut Rpc)) {
        for bucket in self.client_buckets.iter().chain(self.server_buckets.iter()) {
            bucket.with(metrics, |table| {
                for rpc in table.values_mut() {
                    if !rpc.is_dead() {
                        f(rpc);
                    }
                }
            });
        }
    }

    /// Removes and returns dead RPCs, for the lifecycle reaper (C10).
    /// Frees at most `reap_limit` RPCs across the whole call, and skips any
    /// dead RPC with a non-zero `dont_reap` (mid-copy by the application).
    pub fn drain_dead(&self, metrics: &Metrics, reap_limit: usize) -> Vec<Rpc> {
        let mut dead = Vec::new();
        for bucket in self.client_buckets.iter().chain(self.server_buckets.iter()) {
            if dead.len() >= reap_limit {
                break;
            }
            bucket.with(metrics, |table| {
                let budget = reap_limit - dead.len();
                let dead_ids: Vec<u64> = table
                    .iter()
                    .filter(|(_, r)| r.is_dead() && r.dont_reap == 0)
                    .map(|(id, _)| *id)
                    .take(budget)
                    .collect();
                for id in dead_ids {
                    if let Some(rpc) = table.remove(&id) {
                        dead.push(rpc);
                    }
                }
            });
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Outbound;
    use crate::peer::{Peer, PeerTable};
    use crate::Config;
    use std::net::Ipv4Addr;

    fn test_rpc(id: u64) -> Rpc {
        let config = Config::default();
        let table = PeerTable::new();
        let peer = table.find(Ipv4Addr::new(10, 0, 0, 1), &config).unwrap();
        Rpc::new_client(id, peer, 0x8000, 99, Outbound::new(vec![0u8; 10], &config))
    }

    #[test]
    fn bucket_doubles_as_rpc_lock() {
        let metrics = Metrics::default();
        let registry = RpcRegistry::new();
        registry.insert_client(&metrics, test_rpc(5));
        registry.with_client(&metrics, 5, |rpc| {
            assert!(rpc.is_some());
        });
        let removed = registry.remove_client(&metrics, 5);
        assert!(removed.is_some());
        registry.with_client(&metrics, 5, |rpc| assert!(rpc.is_none()));
    }

    #[test]
    fn drain_dead_only_removes_dead_rpcs() {
        let metrics = Metrics::default();
        let registry = RpcRegistry::new();
        let alive = test_rpc(1);
        let mut dead = test_rpc(2);
        dead.mark_dead();
        registry.insert_client(&metrics, alive);
        registry.insert_client(&metrics, dead);
        let reaped = registry.drain_dead(&metrics, usize::MAX);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, 2);
        registry.with_client(&metrics, 1, |rpc| assert!(rpc.is_some()));
    }

    #[test]
    fn drain_dead_honors_reap_limit_and_dont_reap() {
        let metrics = Metrics::default();
        let registry = RpcRegistry::new();
        for id in 1..=3 {
            let mut rpc = test_rpc(id);
            rpc.mark_dead();
            registry.insert_client(&metrics, rpc);
        }
        let mut mid_copy = test_rpc(4);
        mid_copy.mark_dead();
        mid_copy.dont_reap = 1;
        registry.insert_client(&metrics, mid_copy);

        // Only 2 of the 3 plain dead RPCs should be freed this call.
        let reaped = registry.drain_dead(&metrics, 2);
        assert_eq!(reaped.len(), 2);

        // The remaining plain dead RPC frees on a later call; id 4 never
        // does while `dont_reap` stays set.
        let reaped = registry.drain_dead(&metrics, usize::MAX);
        assert_eq!(reaped.len(), 1);
        registry.with_client(&metrics, 4, |rpc| assert!(rpc.is_some()));
    }
}
