//! A datagram-based, message-oriented RPC transport core.
//!
//! This crate implements the message-delivery engine of a receiver-driven,
//! SRPT-scheduled RPC transport: per-RPC send/receive state machines, a
//! grant scheduler, a pacer that meters bytes onto a modeled NIC, a
//! retransmission timer, and the socket/peer/RPC registries that tie them
//! together under a strict lock-ordering discipline.
//!
//! Packet I/O, checksum/segmentation offload, and metrics export are left
//! to the embedder via [`substrate::PacketSubstrate`]; this crate owns only
//! [`engine::Engine`] and the state machines it drives.

pub mod config;
pub mod engine;
pub mod error;
pub mod grant;
pub mod message;
pub mod metrics;
pub mod pacer;
pub mod peer;
pub mod rpc;
pub mod socket;
pub mod substrate;
pub mod timer;
pub mod wire;

pub use config::Config;
pub use engine::Engine;
pub use error::{Result, TransportError};
pub use substrate::PacketSubstrate;
