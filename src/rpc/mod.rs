//! The RPC entity (C4 data, C10 lifecycle): the central unit the rest of
//! the engine operates on.
//!
//! Grounded on `examples/original_source/homa_impl.h`'s `struct homa_rpc`.
//! The per-bucket lock doubling as the per-RPC lock is this crate's own
//! realization of the bucket-locking Open Question (see `DESIGN.md`), not
//! a structure named in the retrieved source. The teacher's
//! `protocol/rpc/mod.rs` module re-export shape is mirrored for the
//! public surface of this module.

pub mod registry;

pub use registry::{RpcBucket, RpcRegistry};

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::message::{Inbound, Outbound};
use crate::peer::Peer;

/// Which side of the request/response pair this RPC represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// Lifecycle state (§4.10). Client and server RPCs follow disjoint paths
/// through this shared enum; [`Rpc::transition`] enforces the edges in
/// the state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Outgoing,
    Incoming,
    Ready,
    InService,
    Dead,
}

/// Terminal error code surfaced to the application on abort/timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    Timeout,
    Aborted,
}

/// Identifies an RPC without borrowing it — the only thing the grantable
/// and throttled sets are allowed to hold, per the design notes: a back
/// reference is valid only while the owning bucket lock is retaken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcKey {
    pub port: u16,
    pub role_is_server: bool,
    pub id: u64,
}

impl RpcKey {
    pub fn new(port: u16, role: Role, id: u64) -> Self {
        RpcKey { port, role_is_server: role == Role::Server, id }
    }
}

#[derive(Debug)]
pub struct Rpc {
    pub id: u64,
    pub role: Role,
    pub peer: Arc<Peer>,
    /// This socket's own bound port.
    pub sport: u16,
    /// The peer-side port: the server port for a client RPC, the client's
    /// ephemeral port for a server RPC.
    pub dport: u16,
    pub state: State,
    pub outbound: Option<Outbound>,
    pub inbound: Option<Inbound>,
    pub error: Option<RpcError>,
    pub silent_ticks: u32,
    pub num_resends: u32,
    pub in_grantable: bool,
    pub in_throttled: bool,
    /// Set whenever a packet for this RPC arrives; cleared by the timer
    /// each tick (§4.9).
    pub received_since_tick: bool,
    /// Non-zero while the application is mid-copy of this RPC's buffer
    /// (`recv`). A dead RPC with `dont_reap != 0` is skipped by reap (C10)
    /// even though the bucket lock already serializes the copy against a
    /// concurrent reap call.
    pub dont_reap: u32,
}

impl Rpc {
    pub fn new_client(id: u64, peer: Arc<Peer>, sport: u16, dport: u16, outbound: Outbound) -> Self {
        Rpc {
            id,
            role: Role::Client,
            peer,
            sport,
            dport,
            state: State::Outgoing,
            outbound: Some(outbound),
            inbound: None,
            error: None,
            silent_ticks: 0,
            num_resends: 0,
            in_grantable: false,
            in_throttled: false,
            received_since_tick: true,
            dont_reap: 0,
        }
    }

    pub fn new_server(id: u64, peer: Arc<Peer>, sport: u16, dport: u16, inbound: Inbound) -> Self {
        Rpc {
            id,
            role: Role::Server,
            peer,
            sport,
            dport,
            state: State::Incoming,
            outbound: None,
            inbound: Some(inbound),
            error: None,
            silent_ticks: 0,
            num_resends: 0,
            in_grantable: false,
            in_throttled: false,
            received_since_tick: true,
            dont_reap: 0,
        }
    }

    pub fn key(&self) -> RpcKey {
        RpcKey::new(self.sport, self.role, self.id)
    }

    pub fn peer_addr(&self) -> Ipv4Addr {
        self.peer.addr
    }

    /// Moves the RPC to `DEAD` with `error` set, regardless of current
    /// state — the only cancellation path (§5): "the only cancellation is
    /// RPC abort."
    pub fn abort(&mut self, error: RpcError) {
        self.state = State::Dead;
        self.error = Some(error);
    }

    /// First DATA of a reply observed on a client RPC: OUTGOING -> INCOMING.
    pub fn client_response_started(&mut self, inbound: Inbound) {
        debug_assert_eq!(self.role, Role::Client);
        debug_assert_eq!(self.state, State::Outgoing);
        self.inbound = Some(inbound);
        self.state = State::Incoming;
    }

    /// `bytes_remaining -> 0`: INCOMING -> READY.
    pub fn mark_ready(&mut self) {
        debug_assert_eq!(self.state, State::Incoming);
        self.state = State::Ready;
    }

    /// Application consumed a completed request: server READY -> IN_SERVICE.
    pub fn server_enters_service(&mut self) {
        debug_assert_eq!(self.role, Role::Server);
        debug_assert_eq!(self.state, State::Ready);
        self.state = State::InService;
    }

    /// Application replied: server IN_SERVICE -> OUTGOING.
    pub fn server_replies(&mut self, outbound: Outbound) {
        debug_assert_eq!(self.role, Role::Server);
        debug_assert_eq!(self.state, State::InService);
        self.outbound = Some(outbound);
        self.state = State::Outgoing;
    }

    /// Client consumed a completed response, or a server's reply has been
    /// fully acknowledged: -> DEAD.
    pub fn mark_dead(&mut self) {
        self.state = State::Dead;
    }

    pub fn is_dead(&self) -> bool {
        self.state == State::Dead
    }
}
