//! The external-collaborator seam (§6): packet I/O, ticks, and scheduling
//! are supplied by the embedder, not this crate.
//!
//! Grounded on the teacher's `#[async_trait] trait NFSTcp` in `tcp.rs` —
//! the same shape, an embedder-implemented async trait the core calls
//! into rather than owning the real I/O itself.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::peer::RouteHandle;

/// What the transport core consumes from the packet I/O substrate. A real
/// implementation would wrap a raw IPv4 socket (protocol 146); tests use
/// an in-memory channel-backed fake (see `tests/support.rs`).
#[async_trait]
pub trait PacketSubstrate: Send + Sync {
    /// Hands `bytes` to the NIC for transmission to `route` at `priority`.
    /// On failure the datagram is still considered freed by the
    /// substrate — callers must not retry the same buffer.
    async fn send_datagram(&self, route: &RouteHandle, priority: u8, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// A monotonic cycle counter, used for pacing and timer bookkeeping.
    fn now_ticks(&self) -> u64;

    /// Arms the periodic timer to fire again after `delay`.
    async fn schedule_task(&self, delay: Duration);

    /// Wakes the pacer task (e.g. because a GRANT freed up send capacity).
    fn wake(&self);
}

/// Resolves a route to `addr`. Not part of [`PacketSubstrate`] because
/// peer resolution is cached in [`crate::peer::PeerTable`] and only needs
/// to happen once per destination; kept here as the seam a substrate
/// implementation would plug route lookup into if it needed real kernel
/// routing rather than the trivial resolver in `peer.rs`.
pub fn route_to(addr: Ipv4Addr) -> RouteHandle {
    RouteHandle { addr }
}
