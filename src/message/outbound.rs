//! Outbound message state (C5): packetizes a user buffer and tracks the
//! `unscheduled`/`granted`/`next` frontiers (§3, §4.5).
//!
//! Grounded on `examples/original_source/homa_outgoing.c`
//! (`homa_message_out_init`, `homa_xmit_data`, the frontier/priority
//! rules) and on the teacher's byte-range-oriented buffer handling in
//! `vfs.rs`'s read/write result types, adapted from a file-offset model to
//! a single contiguous send buffer sliced into wire segments on demand.

use std::sync::atomic::Ordering;

use crate::config::Config;
use crate::peer::Peer;
use crate::wire::DataSegment;

#[derive(Debug)]
pub struct Outbound {
    data: Vec<u8>,
    /// Total message length, `L`.
    pub length: usize,
    /// Bytes transmittable without a grant.
    pub unscheduled: usize,
    /// Bytes the sender is currently allowed to emit. Monotone
    /// non-decreasing, `<= length`.
    pub granted: usize,
    /// Offset of the next untransmitted byte.
    pub next: usize,
    /// Priority assigned by the most recent GRANT for scheduled bytes.
    pub sched_priority: u8,
    /// True once every byte has been handed to the substrate and
    /// acknowledged complete (no more packets to send).
    retransmit_pending: bool,
}

impl Outbound {
    pub fn new(data: Vec<u8>, config: &Config) -> Self {
        let length = data.len();
        let unscheduled = config.unscheduled_bytes(length);
        Outbound {
            data,
            length,
            unscheduled,
            granted: unscheduled.min(length),
            next: 0,
            sched_priority: config.max_sched_prio as u8,
            retransmit_pending: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.length - self.next
    }

    pub fn has_sendable(&self) -> bool {
        self.next < self.granted
    }

    pub fn is_complete(&self) -> bool {
        self.next >= self.length
    }

    /// Priority for a DATA packet starting at `offset`: the destination
    /// peer's unscheduled cutoff table below `unscheduled` (falling back to
    /// `config`'s table before any CUTOFFS has been received from that
    /// peer), `sched_priority` above it (§4.5).
    pub fn priority_for_offset(&self, offset: usize, peer: &Peer, config: &Config) -> u8 {
        if offset < self.unscheduled {
            if peer.cutoff_version.load(Ordering::Relaxed) > 0 {
                let cutoffs = peer.unsched_cutoffs.read().expect("peer cutoffs poisoned");
                Config::priority_from_cutoffs(&cutoffs, self.length)
            } else {
                config.unscheduled_priority(self.length)
            }
        } else {
            self.sched_priority
        }
    }

    /// Takes the next sendable segment, up to `max_len` bytes, advancing
    /// `next`. Returns `None` if `next >= granted` (waiting for a GRANT).
    pub fn take_next_segment(&mut self, max_len: usize) -> Option<DataSegment> {
        if !self.has_sendable() {
            return None;
        }
        let end = (self.next + max_len).min(self.granted).min(self.length);
        if end <= self.next {
            return None;
        }
        let segment = DataSegment {
            offset: self.next as u32,
            bytes: self.data[self.next..end].to_vec(),
        };
        self.next = end;
        Some(segment)
    }

    /// Applies a received GRANT, advancing `granted` (never regressing
    /// it), capped at `length`.
    pub fn apply_grant(&mut self, offset: usize) {
        self.granted = self.granted.max(offset).min(self.length);
    }

    /// Produces a fresh copy of `[start, end)` for retransmission. A
    /// fresh copy is required because the substrate is assumed to mutate
    /// buffers on submit (§4.5).
    pub fn retransmit_range(&mut self, start: usize, end: usize) -> DataSegment {
        let end = end.min(self.length);
        let start = start.min(end);
        self.retransmit_pending = true;
        DataSegment {
            offset: start as u32,
            bytes: self.data[start..end].to_vec(),
        }
    }

    pub fn took_retransmit(&mut self) -> bool {
        std::mem::take(&mut self.retransmit_pending)
    }

    /// Resets state to re-enter OUTGOING from offset 0, for the RESTART
    /// path (§4.10): "reset outbound message (copy datagrams, reset
    /// `next`, clear retransmit flags) and re-enter OUTGOING."
    pub fn reset_for_restart(&mut self, config: &Config) {
        self.next = 0;
        self.unscheduled = config.unscheduled_bytes(self.length);
        self.granted = self.unscheduled.min(self.length);
        self.retransmit_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::default()
    }

    #[test]
    fn invariant_next_le_granted_le_length() {
        let config = cfg();
        let mut out = Outbound::new(vec![0u8; 100_000], &config);
        assert!(out.next <= out.granted && out.granted <= out.length);
        while out.has_sendable() {
            out.take_next_segment(1440);
            assert!(out.next <= out.granted && out.granted <= out.length);
        }
    }

    #[test]
    fn small_message_is_fully_unscheduled() {
        let config = cfg();
        let out = Outbound::new(vec![0u8; 1000], &config);
        assert_eq!(out.unscheduled, 1000);
        assert_eq!(out.granted, 1000);
    }

    #[test]
    fn large_message_gates_on_grant() {
        let config = cfg();
        let mut out = Outbound::new(vec![1u8; 100_000], &config);
        assert_eq!(out.granted, config.rtt_bytes.min(100_000));
        while out.has_sendable() {
            out.take_next_segment(1440);
        }
        assert_eq!(out.next, out.granted);
        assert!(out.remaining() > 0);
        out.apply_grant(20_000);
        assert_eq!(out.granted, 20_000);
        assert!(out.has_sendable());
    }

    #[test]
    fn grant_never_regresses() {
        let config = cfg();
        let mut out = Outbound::new(vec![1u8; 100_000], &config);
        out.apply_grant(20_000);
        out.apply_grant(10_000);
        assert_eq!(out.granted, 20_000);
    }
}
