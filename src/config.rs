//! Tunables and wire constants, constructed explicitly by the embedder —
//! never loaded from environment variables or a sysctl-style global.

/// Largest permissible message size, in bytes.
pub const HOMA_MAX_MESSAGE: usize = 1_000_000;

/// Largest allowable packet header, in bytes. Every wire packet type must
/// fit within this bound (§4.1).
pub const HOMA_MAX_HEADER: usize = 64;

/// Number of distinct priority levels the wire format can express.
pub const HOMA_NUM_PRIORITIES: usize = 8;

/// IPv4 protocol number this transport is registered under.
pub const IPPROTO_TRANSPORT: u8 = 146;

/// First port number handed out to auto-assigned client sockets. Server
/// ports occupy `[1, HOMA_MIN_CLIENT_PORT)`.
pub const HOMA_MIN_CLIENT_PORT: u16 = 0x8000;

/// Number of hash buckets in each socket's client/server RPC tables.
/// Power of two, matching `homa_impl.h`'s `HOMA_CLIENT_RPC_BUCKETS` /
/// `HOMA_SERVER_RPC_BUCKETS` sizing rationale (cache-line sized, low
/// contention).
pub const RPC_BUCKETS: usize = 1024;

/// Number of hash buckets in the socket registry.
pub const SOCKTAB_BUCKETS: usize = 1024;

/// Maximum bytes of message data per wire packet at the scenario MTU
/// (1500 - 20 IP - 40 overhead) used throughout §8's literal examples.
pub const MAX_PKT_DATA: usize = 1440;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bytes transmittable in one RTT without a grant. Rounded up
    /// internally to a multiple of `max_gso_size`.
    pub rtt_bytes: usize,
    /// Uplink bandwidth, used to convert queued bytes into a modeled
    /// drain time for the pacer.
    pub link_mbps: u32,
    /// Number of priority levels in use, `1..=HOMA_NUM_PRIORITIES`.
    pub num_priorities: usize,
    /// Split point: priorities `< max_sched_prio` are available to
    /// unscheduled traffic, compared against `unsched_cutoffs`.
    pub max_sched_prio: usize,
    /// Message-length cutoffs selecting the unscheduled priority for a
    /// message of that size. At least one entry must be `>= HOMA_MAX_MESSAGE`.
    pub unsched_cutoffs: Vec<u32>,
    /// Bytes a single GRANT advances `incoming` by.
    pub grant_increment: usize,
    /// Maximum number of RPCs the grant scheduler will keep granted
    /// simultaneously (overcommit cap).
    pub max_overcommit: usize,
    /// Consecutive silent timer ticks before a RESEND is considered.
    pub resend_ticks: u32,
    /// Minimum ticks between RESENDs to the same peer.
    pub resend_interval: u32,
    /// Number of RESENDs tolerated before an RPC is aborted.
    pub abort_resends: u32,
    /// Packets smaller than this bypass throttled-list bookkeeping and are
    /// sent unconditionally.
    pub throttle_min_bytes: usize,
    /// NIC queue cap, in nanoseconds of modeled drain time.
    pub max_nic_queue_ns: u64,
    /// Largest generic-segmentation-offload unit, in bytes.
    pub max_gso_size: usize,
    /// Largest number of segments a single generic-receive-offload batch
    /// may deliver.
    pub max_gro_skbs: usize,
    /// Maximum number of dead RPCs freed in a single reap call (C10).
    pub reap_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        let mut unsched_cutoffs = vec![200, 2_000, 20_000, 200_000];
        unsched_cutoffs.resize(HOMA_NUM_PRIORITIES, HOMA_MAX_MESSAGE as u32);
        Config {
            rtt_bytes: 10_000,
            link_mbps: 10_000,
            num_priorities: HOMA_NUM_PRIORITIES,
            max_sched_prio: HOMA_NUM_PRIORITIES - 1,
            unsched_cutoffs,
            grant_increment: 10_000,
            max_overcommit: 8,
            resend_ticks: 5,
            resend_interval: 5,
            abort_resends: 5,
            throttle_min_bytes: 1_000,
            max_nic_queue_ns: 2_000,
            max_gso_size: 65_536,
            max_gro_skbs: 20,
            reap_limit: 10,
        }
    }
}

impl Config {
    /// `unscheduled` bytes for a message of total length `len`: the
    /// smaller of `rtt_bytes` and `len`, rounded up to a whole number of
    /// offload units (clamped back down to `len`).
    pub fn unscheduled_bytes(&self, len: usize) -> usize {
        let bound = self.rtt_bytes.min(len);
        if bound == 0 || self.max_gso_size == 0 {
            return bound;
        }
        let rounded = bound.div_ceil(self.max_gso_size) * self.max_gso_size;
        rounded.min(len)
    }

    /// Unscheduled priority for a message of total length `len`, per the
    /// cutoff table: the lowest-indexed cutoff entry `>= len`.
    pub fn unscheduled_priority(&self, len: usize) -> u8 {
        Self::priority_from_cutoffs(&self.unsched_cutoffs, len)
    }

    /// Same lookup as [`Config::unscheduled_priority`], but against an
    /// arbitrary cutoff table — used to evaluate a peer's own table after
    /// it advertises one via a CUTOFFS packet (§4.5).
    pub fn priority_from_cutoffs(cutoffs: &[u32], len: usize) -> u8 {
        for (prio, cutoff) in cutoffs.iter().enumerate() {
            if (len as u32) <= *cutoff {
                return prio as u8;
            }
        }
        (cutoffs.len().saturating_sub(1)) as u8
    }

    pub fn max_nic_queue_cycles(&self) -> u64 {
        self.max_nic_queue_ns
    }
}
