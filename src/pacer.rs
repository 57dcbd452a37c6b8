//! Pacer (C8): meters bytes onto the modeled NIC using an atomic
//! link-idle timestamp, and drains the throttled set in SRPT order.
//!
//! Grounded on `examples/original_source/homa_outgoing.c`'s
//! `homa_check_pacer`/xmit loop and its `link_idle_time` CAS logic; the
//! dedicated-background-task shape is grounded on the teacher's `tcp.rs`
//! `tokio::spawn` + loop pattern.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::metrics::Metrics;
use crate::rpc::RpcKey;

type Entry = (usize, u64, RpcKey);

#[derive(Default)]
struct ThrottledInner {
    set: BTreeSet<Entry>,
    membership: HashMap<RpcKey, (usize, u64)>,
}

/// Outbound RPCs parked because the modeled NIC queue was over cap,
/// ordered by `remaining = L - next` ascending (§4.8). One mutex guards
/// both the ordered set and its membership index, taken try-first like
/// the RPC bucket lock (§5): a contended acquisition counts as a miss
/// before falling back to blocking.
#[derive(Default)]
pub struct ThrottledSet {
    inner: Mutex<ThrottledInner>,
    next_seq: AtomicU64,
}

impl ThrottledSet {
    pub fn new() -> Self {
        ThrottledSet::default()
    }

    fn with<T>(&self, metrics: &Metrics, f: impl FnOnce(&mut ThrottledInner) -> T) -> T {
        match self.inner.try_lock() {
            Ok(mut guard) => f(&mut guard),
            Err(_) => {
                Metrics::incr(&metrics.throttle_lock_misses);
                let mut guard = self.inner.lock().expect("throttled set poisoned");
                f(&mut guard)
            }
        }
    }

    pub fn upsert(&self, metrics: &Metrics, key: RpcKey, remaining: usize) {
        self.with(metrics, |inner| {
            if let Some((old_remaining, old_seq)) = inner.membership.get(&key).copied() {
                inner.set.remove(&(old_remaining, old_seq, key));
                inner.set.insert((remaining, old_seq, key));
                inner.membership.insert(key, (remaining, old_seq));
            } else {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                inner.set.insert((remaining, seq, key));
                inner.membership.insert(key, (remaining, seq));
            }
        });
    }

    pub fn remove(&self, metrics: &Metrics, key: RpcKey) {
        self.with(metrics, |inner| {
            if let Some((remaining, seq)) = inner.membership.remove(&key) {
                inner.set.remove(&(remaining, seq, key));
            }
        });
    }

    /// Pops the shortest-remaining entry (SRPT head), if any.
    pub fn pop_shortest(&self, metrics: &Metrics) -> Option<RpcKey> {
        self.with(metrics, |inner| {
            let entry = *inner.set.iter().next()?;
            inner.set.remove(&entry);
            inner.membership.remove(&entry.2);
            Some(entry.2)
        })
    }

    pub fn is_empty(&self, metrics: &Metrics) -> bool {
        self.with(metrics, |inner| inner.set.is_empty())
    }
}

/// Ethernet + VLAN + IP overhead modeled per packet, in bytes.
const PACKET_OVERHEAD_BYTES: usize = 58;

/// Bytes-to-nanoseconds cost of queuing a packet, multiplied by
/// `segment_count` for offload batches (§4.8).
pub fn packet_cost_ns(bytes: usize, segment_count: usize, link_mbps: u32) -> u64 {
    let overhead = PACKET_OVERHEAD_BYTES.saturating_mul(segment_count.max(1));
    let total_bits = ((bytes + overhead) as u64).saturating_mul(8);
    total_bits.saturating_mul(1000) / (link_mbps.max(1) as u64)
}

/// The modeled NIC queue: a monotone cycle-count estimate of when
/// already-queued bytes will have drained, updated by CAS and read by
/// atomic load — never under a lock (§4.8, §5).
#[derive(Default)]
pub struct LinkIdle {
    ticks: AtomicU64,
}

impl LinkIdle {
    pub fn new() -> Self {
        LinkIdle::default()
    }

    /// Attempts to reserve `cost` worth of NIC time starting no earlier
    /// than `now`. Refuses (returns `false`) if the queue is already over
    /// `max_nic_queue_cycles` ahead of `now` and `force` is false.
    pub fn try_reserve(&self, now: u64, cost: u64, max_nic_queue_cycles: u64, force: bool) -> bool {
        loop {
            let idle = self.ticks.load(Ordering::Acquire);
            if !force && now.saturating_add(max_nic_queue_cycles) < idle {
                return false;
            }
            let new_idle = idle.max(now).saturating_add(cost);
            if self
                .ticks
                .compare_exchange_weak(idle, new_idle, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn queue_ahead_of(&self, now: u64) -> u64 {
        self.ticks.load(Ordering::Acquire).saturating_sub(now)
    }
}

/// At most one pacer instance runs at a time: a 0<->1 atomic flag (§4.8).
/// Other callers' opportunistic "check_pacer" hooks are no-ops while the
/// pacer is already active.
#[derive(Default)]
pub struct PacerGuardFlag {
    running: AtomicBool,
}

impl PacerGuardFlag {
    pub fn new() -> Self {
        PacerGuardFlag::default()
    }

    /// Tries to become the sole active pacer instance. Returns a guard
    /// that releases the flag on drop, or `None` if the pacer is already
    /// running elsewhere.
    pub fn try_enter(&self) -> Option<PacerGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PacerGuard { flag: self })
    }
}

pub struct PacerGuard<'a> {
    flag: &'a PacerGuardFlag,
}

impl Drop for PacerGuard<'_> {
    fn drop(&mut self) {
        self.flag.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Role;

    fn key(id: u64) -> RpcKey {
        RpcKey::new(1, Role::Client, id)
    }

    #[test]
    fn throttled_set_drains_shortest_first() {
        let metrics = Metrics::default();
        let set = ThrottledSet::new();
        set.upsert(&metrics, key(1), 20_000); // A
        set.upsert(&metrics, key(2), 5_000); // B
        assert_eq!(set.pop_shortest(&metrics), Some(key(2)));
        assert_eq!(set.pop_shortest(&metrics), Some(key(1)));
        assert_eq!(set.pop_shortest(&metrics), None);
    }

    #[test]
    fn link_idle_refuses_when_over_cap() {
        let idle = LinkIdle::new();
        assert!(idle.try_reserve(0, 5_000, 2_000, false));
        // now=0, max_nic_queue_cycles=2000, idle=5000 -> 0+2000 < 5000 -> refuse
        assert!(!idle.try_reserve(0, 1_000, 2_000, false));
    }

    #[test]
    fn link_idle_force_always_permits() {
        let idle = LinkIdle::new();
        assert!(idle.try_reserve(0, 5_000, 2_000, false));
        assert!(idle.try_reserve(0, 1_000, 2_000, true));
    }

    #[test]
    fn only_one_pacer_active_at_a_time() {
        let flag = PacerGuardFlag::new();
        let guard = flag.try_enter();
        assert!(guard.is_some());
        assert!(flag.try_enter().is_none());
        drop(guard);
        assert!(flag.try_enter().is_some());
    }

    #[test]
    fn cost_scales_with_segment_count() {
        let one_segment = packet_cost_ns(1000, 1, 10_000);
        let two_segments = packet_cost_ns(1000, 2, 10_000);
        assert!(two_segments > one_segment);
    }
}
