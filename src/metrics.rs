//! In-process counters, grounded on `homa_impl.h`'s `struct homa_metrics`.
//!
//! Unlike the source, these are a single atomic struct rather than
//! per-CPU, and there is no `/proc`-style export surface: reading a
//! snapshot is a plain method an embedder may wire to its own
//! observability stack.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub bucket_lock_misses: AtomicU64,
    pub throttle_lock_misses: AtomicU64,
    pub grantable_lock_misses: AtomicU64,
    pub short_packets: AtomicU64,
    pub unknown_type_packets: AtomicU64,
    pub unknown_rpc_drops: AtomicU64,
    pub resends_sent: AtomicU64,
    pub restarts_sent: AtomicU64,
    pub grants_sent: AtomicU64,
    pub throttle_entries: AtomicU64,
    pub rpcs_aborted_timeout: AtomicU64,
    pub rpcs_reaped: AtomicU64,
    pub transmit_errors: AtomicU64,
}

/// Point-in-time values pulled out of the atomics for inspection/logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub bucket_lock_misses: u64,
    pub throttle_lock_misses: u64,
    pub grantable_lock_misses: u64,
    pub short_packets: u64,
    pub unknown_type_packets: u64,
    pub unknown_rpc_drops: u64,
    pub resends_sent: u64,
    pub restarts_sent: u64,
    pub grants_sent: u64,
    pub throttle_entries: u64,
    pub rpcs_aborted_timeout: u64,
    pub rpcs_reaped: u64,
    pub transmit_errors: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bucket_lock_misses: self.bucket_lock_misses.load(Ordering::Relaxed),
            throttle_lock_misses: self.throttle_lock_misses.load(Ordering::Relaxed),
            grantable_lock_misses: self.grantable_lock_misses.load(Ordering::Relaxed),
            short_packets: self.short_packets.load(Ordering::Relaxed),
            unknown_type_packets: self.unknown_type_packets.load(Ordering::Relaxed),
            unknown_rpc_drops: self.unknown_rpc_drops.load(Ordering::Relaxed),
            resends_sent: self.resends_sent.load(Ordering::Relaxed),
            restarts_sent: self.restarts_sent.load(Ordering::Relaxed),
            grants_sent: self.grants_sent.load(Ordering::Relaxed),
            throttle_entries: self.throttle_entries.load(Ordering::Relaxed),
            rpcs_aborted_timeout: self.rpcs_aborted_timeout.load(Ordering::Relaxed),
            rpcs_reaped: self.rpcs_reaped.load(Ordering::Relaxed),
            transmit_errors: self.transmit_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
