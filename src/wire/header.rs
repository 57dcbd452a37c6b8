//! The common header shared by all eight packet types (§4.1), laid out to
//! coexist with segmentation-offload hardware that expects TCP-shaped
//! sequence/ack fields at fixed offsets.

use crate::wire::{PacketType, Wire};
use crate::WireStruct;

/// Shared prefix of every wire packet. `id` is the one field that is
/// *not* byte-swapped semantically: it's opaque to the peer and round-
/// trips byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub sport: u16,
    pub dport: u16,
    /// Mirrors a TCP sequence number field; unused by this transport.
    pub seq_reserved: u32,
    /// Mirrors a TCP ack number field; unused by this transport.
    pub ack_reserved: u32,
    /// Header length in 4-byte words, mirroring TCP's data-offset byte.
    pub doff: u8,
    pub packet_type: PacketType,
    /// Number of GRO-aggregated packets carried in this datagram
    /// (offload-aggregation counter).
    pub gro_count: u8,
    /// Checksum slot mirroring TCP's; the substrate owns real checksum
    /// offload, so this transport always writes/reads zero.
    pub checksum: u16,
    /// Debug-only priority annotation; actual scheduling priority lives
    /// outside the wire format (offload hardware steers by queue, not by
    /// this field).
    pub priority: u8,
    pub id: u64,
}

impl CommonHeader {
    /// Size of the common header on the wire, in bytes.
    pub const WIRE_SIZE: usize = 2 + 2 + 4 + 4 + 1 + 1 + 1 + 2 + 1 + 8;

    pub fn new(sport: u16, dport: u16, packet_type: PacketType, priority: u8, id: u64) -> Self {
        CommonHeader {
            sport,
            dport,
            seq_reserved: 0,
            ack_reserved: 0,
            doff: (Self::WIRE_SIZE / 4) as u8,
            packet_type,
            gro_count: 0,
            checksum: 0,
            priority,
            id,
        }
    }
}

WireStruct!(
    CommonHeader,
    sport,
    dport,
    seq_reserved,
    ack_reserved,
    doff,
    packet_type,
    gro_count,
    checksum,
    priority,
    id,
);

const _: () = assert!(CommonHeader::WIRE_SIZE <= crate::config::HOMA_MAX_HEADER);
