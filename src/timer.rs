//! Timer/resend (C9): the periodic silent-tick scan that drives loss
//! detection and abort-on-timeout.
//!
//! Grounded on `examples/original_source/homa_outgoing.c`'s resend-tick
//! logic; the periodic-background-task shape is grounded on the
//! teacher's `tcp.rs` `tokio::time::interval`-driven task.

use crate::config::Config;
use crate::rpc::{Role, Rpc, RpcError, RpcKey, State};

/// What the timer decided to do about one RPC on this tick. The engine
/// turns a [`TimerAction::Resend`] into an actual RESEND packet (it needs
/// the peer's route, which isn't this module's concern) and an
/// [`TimerAction::Abort`] into waking any blocked receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Resend { key: RpcKey, offset: u32, length: u32 },
    Abort { key: RpcKey },
}

/// Evaluates one active RPC for one tick, per §4.9. Must be called with
/// the RPC's bucket lock held (it mutates `silent_ticks`/`num_resends`).
/// `peer_due_for_resend` reports whether `(now - peer.last_resend_tick)
/// >= resend_interval`, checked by the caller against the shared `Peer`.
pub fn evaluate_tick(
    rpc: &mut Rpc,
    config: &Config,
    peer_due_for_resend: impl FnOnce() -> bool,
    first_gap: Option<(usize, usize)>,
) -> Option<TimerAction> {
    if rpc.state == State::Dead {
        return None;
    }

    if rpc.received_since_tick {
        rpc.silent_ticks = 0;
    } else {
        rpc.silent_ticks += 1;
    }
    rpc.received_since_tick = false;

    if rpc.silent_ticks < config.resend_ticks {
        return None;
    }

    let expecting_more_bytes = matches!(rpc.state, State::Incoming) || (rpc.role == Role::Client && rpc.state == State::Outgoing && rpc.inbound.is_none());
    if !expecting_more_bytes {
        return None;
    }

    if !peer_due_for_resend() {
        return None;
    }

    rpc.num_resends += 1;
    if rpc.num_resends >= config.abort_resends {
        let error = if rpc.role == Role::Client { RpcError::Timeout } else { RpcError::Aborted };
        rpc.abort(error);
        return Some(TimerAction::Abort { key: rpc.key() });
    }

    let (start, end) = first_gap.unwrap_or((0, 0));
    Some(TimerAction::Resend {
        key: rpc.key(),
        offset: start as u32,
        length: (end - start) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Outbound;
    use crate::peer::PeerTable;
    use crate::Config;
    use std::net::Ipv4Addr;

    fn client_rpc(config: &Config) -> Rpc {
        let table = PeerTable::new();
        let peer = table.find(Ipv4Addr::new(10, 0, 0, 2), config).unwrap();
        Rpc::new_client(1, peer, 0x8000, 99, Outbound::new(vec![0u8; 10], config))
    }

    #[test]
    fn silent_ticks_reset_on_receipt() {
        let config = Config::default();
        let mut rpc = client_rpc(&config);
        rpc.received_since_tick = false;
        rpc.silent_ticks = 3;
        rpc.received_since_tick = true;
        let action = evaluate_tick(&mut rpc, &config, || true, None);
        assert_eq!(action, None);
        assert_eq!(rpc.silent_ticks, 0);
    }

    #[test]
    fn abort_after_abort_resends_reached() {
        let mut config = Config::default();
        config.resend_ticks = 1;
        config.abort_resends = 1;
        let mut rpc = client_rpc(&config);
        rpc.received_since_tick = false;
        let action = evaluate_tick(&mut rpc, &config, || true, Some((0, 10)));
        assert_eq!(action, Some(TimerAction::Abort { key: rpc.key() }));
        assert_eq!(rpc.state, State::Dead);
        assert_eq!(rpc.error, Some(RpcError::Timeout));
    }

    #[test]
    fn resend_emitted_for_first_gap() {
        let mut config = Config::default();
        config.resend_ticks = 1;
        config.abort_resends = 5;
        let mut rpc = client_rpc(&config);
        rpc.state = State::Incoming;
        rpc.received_since_tick = false;
        let action = evaluate_tick(&mut rpc, &config, || true, Some((1440, 4320)));
        assert_eq!(action, Some(TimerAction::Resend { key: rpc.key(), offset: 1440, length: 2880 }));
    }
}
