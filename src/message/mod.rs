//! Outbound (C5) and inbound (C6) per-RPC message state.

pub mod inbound;
pub mod outbound;

pub use inbound::Inbound;
pub use outbound::Outbound;
