//! Typed error taxonomy for the transport core.
//!
//! Individual failure sites use [`TransportError`] so callers can match on
//! `kind` (abort policy, metrics counting); functions that aggregate
//! several fallible steps return [`anyhow::Result`], matching the
//! surrounding crate's boundary convention.

use std::net::Ipv4Addr;

/// One variant per error kind in the error-handling design.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A received packet was too short for its declared type, or its type
    /// byte didn't match any known packet.
    #[error("malformed packet from {src}: {reason}")]
    MalformedPacket { src: Ipv4Addr, reason: &'static str },

    /// A control packet named an RPC id this socket has no record of.
    #[error("unknown rpc {id} on port {port}")]
    UnknownRpc { port: u16, id: u64 },

    /// Route resolution failed while inserting a new peer.
    #[error("no route to {addr}")]
    RouteFailure { addr: Ipv4Addr },

    /// The RPC's silence timer exceeded `abort_resends` resends.
    #[error("rpc {id} timed out")]
    Timeout { id: u64 },

    /// Allocation failed while constructing an outbound message or buffer.
    #[error("resource exhausted: {reason}")]
    ResourceExhausted { reason: &'static str },

    /// Not actually an error: the caller should park the RPC on the
    /// throttled list rather than transmit. Kept as a variant so it flows
    /// through the same `Result` plumbing as real failures.
    #[error("nic queue over cap")]
    NicOverQueued,

    /// The packet substrate failed to hand a datagram to the NIC. The
    /// substrate is assumed to have freed the datagram regardless.
    #[error("transmit failed: {reason}")]
    TransmitError { reason: String },

    /// The requested send length was zero or exceeded `HOMA_MAX_MESSAGE`.
    #[error("invalid message length {len}")]
    InvalidLength { len: usize },
}

impl TransportError {
    /// True for kinds that represent normal flow control rather than a
    /// genuine fault (only [`TransportError::NicOverQueued`] today).
    pub fn is_flow_control(&self) -> bool {
        matches!(self, TransportError::NicOverQueued)
    }
}

pub type Result<T> = std::result::Result<T, anyhow::Error>;
