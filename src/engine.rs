//! `Engine`: the explicit, non-singleton context value that owns every
//! registry and tunable and exposes the application/substrate surface
//! from §6.
//!
//! Grounded on the teacher's `protocol/rpc/context.rs` `Context` struct
//! (an explicit state bundle passed around rather than a global) and on
//! `tcp.rs`'s `process_socket`-style dispatch-by-type loop, generalized
//! from a single TCP connection's framing to per-packet dispatch over a
//! datagram substrate.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::config::{Config, MAX_PKT_DATA};
use crate::error::TransportError;
use crate::grant::{next_grant_offset, GrantableSet};
use crate::message::{Inbound, Outbound};
use crate::metrics::Metrics;
use crate::pacer::{packet_cost_ns, LinkIdle, PacerGuardFlag, ThrottledSet};
use crate::peer::{PeerTable, RouteHandle};
use crate::rpc::{Role, Rpc, RpcError, RpcKey, State};
use crate::socket::{Socket, SocketRegistry, Want};
use crate::substrate::PacketSubstrate;
use crate::wire::{
    decode_packet, encode_packet, CommonHeader, CutoffsPayload, DataPayload, GrantPayload, Packet, PacketType,
    ResendPayload, RestartPayload,
};

/// Outcome of a completed `recv`: either a delivered message or the
/// terminal error an aborted/timed-out RPC carries.
#[derive(Debug)]
pub struct RecvResult {
    pub id: u64,
    pub buffer: Vec<u8>,
    pub error: Option<RpcError>,
}

pub struct Engine<S: PacketSubstrate> {
    config: Config,
    metrics: Metrics,
    peers: PeerTable,
    sockets: SocketRegistry,
    grantable: GrantableSet,
    throttled: ThrottledSet,
    link_idle: LinkIdle,
    pacer_flag: PacerGuardFlag,
    substrate: Arc<S>,
}

impl<S: PacketSubstrate + 'static> Engine<S> {
    /// Builds the engine and spawns its pacer and timer background
    /// tasks. Returns an `Arc` because both tasks hold a clone for the
    /// lifetime of the engine.
    pub fn new(config: Config, substrate: Arc<S>) -> Arc<Self> {
        let engine = Arc::new(Engine {
            config,
            metrics: Metrics::default(),
            peers: PeerTable::new(),
            sockets: SocketRegistry::new(),
            grantable: GrantableSet::new(),
            throttled: ThrottledSet::new(),
            link_idle: LinkIdle::new(),
            pacer_flag: PacerGuardFlag::new(),
            substrate,
        });
        engine.clone().spawn_pacer_task();
        engine.clone().spawn_timer_task();
        engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn bind_server(&self, port: u16) -> Result<Arc<Socket>, TransportError> {
        self.sockets.bind_server(port)
    }

    pub fn bind_client(&self) -> Arc<Socket> {
        self.sockets.bind_client()
    }

    // ---------------------------------------------------------------
    // Application interface (§6)
    // ---------------------------------------------------------------

    #[instrument(skip(self, socket, buffer))]
    pub async fn send(&self, socket: &Arc<Socket>, peer_addr: Ipv4Addr, dport: u16, buffer: Vec<u8>) -> Result<u64, TransportError> {
        if buffer.is_empty() || buffer.len() > crate::config::HOMA_MAX_MESSAGE {
            return Err(TransportError::InvalidLength { len: buffer.len() });
        }
        let peer = self.peers.find(peer_addr, &self.config)?;
        let id = socket.alloc_client_id();
        let outbound = Outbound::new(buffer, &self.config);
        let rpc = Rpc::new_client(id, peer, socket.port, dport, outbound);
        socket.rpcs.insert_client(&self.metrics, rpc);
        self.transmit_available(socket, Role::Client, id).await?;
        Ok(id)
    }

    /// Blocks until a message matching `want` is ready, then returns it.
    pub async fn recv(&self, socket: &Arc<Socket>, want: Want) -> RecvResult {
        let key = socket.wait_ready(want).await;
        let role = if key.role_is_server { Role::Server } else { Role::Client };
        let extracted = socket.rpcs.with_role(&self.metrics, role, key.id, |maybe| {
            maybe.map(|rpc| {
                rpc.dont_reap += 1;
                let error = rpc.error;
                let buffer = rpc.inbound.take().map(Inbound::into_buffer).unwrap_or_default();
                rpc.dont_reap -= 1;
                (buffer, error)
            })
        });
        let (buffer, error) = extracted.unwrap_or_default();
        // Client RPCs are fully consumed on recv (-> DEAD); server RPCs
        // move into IN_SERVICE so the application can `reply` (§4.10).
        socket.rpcs.with_role(&self.metrics, role, key.id, |maybe| {
            if let Some(rpc) = maybe {
                match role {
                    Role::Client => rpc.mark_dead(),
                    Role::Server => {
                        if rpc.state == State::Ready {
                            rpc.server_enters_service();
                        }
                    }
                }
            }
        });
        RecvResult { id: key.id, buffer, error }
    }

    #[instrument(skip(self, socket, buffer))]
    pub async fn reply(&self, socket: &Arc<Socket>, id: u64, buffer: Vec<u8>) -> Result<(), TransportError> {
        let outbound = Outbound::new(buffer, &self.config);
        let prepared = socket.rpcs.with_server(&self.metrics, id, |maybe| {
            let rpc = maybe.ok_or(TransportError::UnknownRpc { port: socket.port, id })?;
            rpc.server_replies(outbound);
            Ok::<(), TransportError>(())
        });
        prepared?;
        self.transmit_available(socket, Role::Server, id).await?;
        Ok(())
    }

    pub async fn abort(&self, socket: &Arc<Socket>, id: u64) {
        let role = if socket.rpcs.with_client(&self.metrics, id, |r| r.is_some()) { Role::Client } else { Role::Server };
        socket.rpcs.with_role(&self.metrics, role, id, |maybe| {
            if let Some(rpc) = maybe {
                rpc.abort(RpcError::Aborted);
                self.grantable.remove(&self.metrics, rpc.key());
                self.throttled.remove(&self.metrics, rpc.key());
            }
        });
        socket.push_ready(RpcKey::new(socket.port, role, id));
    }

    // ---------------------------------------------------------------
    // Packet dispatch (§4.1, §4.10) — the softirq-equivalent entry point
    // ---------------------------------------------------------------

    #[instrument(skip(self, socket, bytes))]
    pub async fn deliver_packet(&self, socket: &Arc<Socket>, src_addr: Ipv4Addr, bytes: &[u8]) -> Result<(), TransportError> {
        let decoded = decode_packet(src_addr, bytes);
        let (header, packet) = match decoded {
            Ok(v) => v,
            Err(e) => {
                match &e {
                    TransportError::MalformedPacket { reason, .. } if reason.contains("common header") => {
                        Metrics::incr(&self.metrics.short_packets);
                    }
                    _ => Metrics::incr(&self.metrics.unknown_type_packets),
                }
                return Err(e);
            }
        };
        match packet {
            Packet::Data(payload) => self.handle_data(socket, src_addr, &header, payload).await,
            Packet::Grant(payload) => self.handle_grant(socket, &header, payload).await,
            Packet::Resend(payload) => self.handle_resend(socket, src_addr, &header, payload).await,
            Packet::Restart(_) => self.handle_restart(socket, &header).await,
            Packet::Busy(_) => self.handle_busy(socket, &header),
            Packet::Cutoffs(payload) => self.handle_cutoffs(src_addr, payload),
            Packet::Freeze(_) => Ok(()),
        }
    }

    async fn handle_data(&self, socket: &Arc<Socket>, src_addr: Ipv4Addr, header: &CommonHeader, payload: DataPayload) -> Result<(), TransportError> {
        let id = header.id;
        let unscheduled = self.config.unscheduled_bytes(payload.message_length as usize) as u32;

        // First consult the client bucket: DATA for an id we originated
        // ourselves is a response.
        let mut became_ready = false;
        let handled_as_client = socket.rpcs.with_client(&self.metrics, id, |maybe| {
            let rpc = match maybe {
                Some(rpc) => rpc,
                None => return false,
            };
            rpc.received_since_tick = true;
            if rpc.state == State::Outgoing {
                rpc.client_response_started(Inbound::new(payload.message_length as usize, payload.incoming, unscheduled));
            }
            if let Some(inbound) = rpc.inbound.as_mut() {
                for seg in &payload.segments {
                    inbound.add_packet(seg);
                }
                inbound.observe_incoming(payload.incoming, 0, unscheduled);
                if inbound.is_complete() && rpc.state == State::Incoming {
                    rpc.mark_ready();
                    became_ready = true;
                }
            }
            self.update_grantable(rpc);
            true
        });
        if handled_as_client {
            if became_ready {
                socket.push_ready(RpcKey::new(socket.port, Role::Client, id));
            }
            self.run_grant_pass().await?;
            return Ok(());
        }

        // Otherwise this is request data for a server RPC, creating one
        // on first DATA (§4.10).
        let exists = socket.rpcs.with_server(&self.metrics, id, |r| r.is_some());
        if !exists {
            let peer = self.peers.find(src_addr, &self.config)?;
            let inbound = Inbound::new(payload.message_length as usize, payload.incoming, unscheduled);
            let rpc = Rpc::new_server(id, peer, socket.port, header.sport, inbound);
            socket.rpcs.insert_server(&self.metrics, rpc);
        }
        socket.rpcs.with_server(&self.metrics, id, |maybe| {
            if let Some(rpc) = maybe {
                rpc.received_since_tick = true;
                if let Some(inbound) = rpc.inbound.as_mut() {
                    for seg in &payload.segments {
                        inbound.add_packet(seg);
                    }
                    inbound.observe_incoming(payload.incoming, 0, unscheduled);
                    if inbound.is_complete() && rpc.state == State::Incoming {
                        rpc.mark_ready();
                        became_ready = true;
                    }
                }
                self.update_grantable(rpc);
            }
        });
        if became_ready {
            socket.push_ready(RpcKey::new(socket.port, Role::Server, id));
        }
        self.run_grant_pass().await?;
        Ok(())
    }

    async fn handle_grant(&self, socket: &Arc<Socket>, header: &CommonHeader, payload: GrantPayload) -> Result<(), TransportError> {
        let id = header.id;
        let mut found_role = socket.rpcs.with_client(&self.metrics, id, |maybe| {
            let rpc = maybe?;
            let out = rpc.outbound.as_mut()?;
            out.apply_grant(payload.offset as usize);
            rpc.received_since_tick = true;
            Some(Role::Client)
        });
        if found_role.is_none() {
            found_role = socket.rpcs.with_server(&self.metrics, id, |maybe| {
                let rpc = maybe?;
                let out = rpc.outbound.as_mut()?;
                out.apply_grant(payload.offset as usize);
                rpc.received_since_tick = true;
                Some(Role::Server)
            });
        }
        // A grant only ever unblocks the side of this RPC that owns the
        // outbound message; re-drive its transmit loop now that `granted`
        // has advanced, rather than waiting for some other caller to
        // notice (§4.7: a GRANT's effect is to make more bytes sendable).
        if let Some(role) = found_role {
            self.substrate.wake();
            self.transmit_available(socket, role, id).await?;
        }
        Ok(())
    }

    async fn handle_resend(&self, socket: &Arc<Socket>, src_addr: Ipv4Addr, header: &CommonHeader, payload: ResendPayload) -> Result<(), TransportError> {
        let id = header.id;
        type RetransmitInfo = (RouteHandle, u16, u16, DataSegmentOwned, u8);
        fn collect_retransmit(maybe: Option<&mut Rpc>, payload: &ResendPayload, config: &Config) -> Option<RetransmitInfo> {
            let rpc = maybe?;
            let out = rpc.outbound.as_mut()?;
            let seg = out.retransmit_range(payload.offset as usize, (payload.offset + payload.length) as usize);
            let priority = out.priority_for_offset(seg.offset as usize, &rpc.peer, config);
            Some((rpc.peer.route.clone(), rpc.dport, rpc.sport, DataSegmentOwned { offset: seg.offset, bytes: seg.bytes, length: out.length, incoming: out.granted as u32 }, priority))
        }
        let mut info = socket.rpcs.with_client(&self.metrics, id, |maybe| collect_retransmit(maybe, &payload, &self.config));
        if info.is_none() {
            info = socket.rpcs.with_server(&self.metrics, id, |maybe| collect_retransmit(maybe, &payload, &self.config));
        }
        match info {
            Some((route, dport, sport, seg, priority)) => {
                let header = CommonHeader::new(sport, dport, PacketType::Data, priority, id);
                let payload = Packet::Data(DataPayload {
                    message_length: seg.length as u32,
                    incoming: seg.incoming,
                    cutoff_version: 0,
                    retransmit: true,
                    segments: vec![crate::wire::DataSegment { offset: seg.offset, bytes: seg.bytes }],
                });
                let bytes = encode_packet(&header, &payload);
                if self.send_datagram_counted(&route, priority, bytes).await {
                    Metrics::incr(&self.metrics.resends_sent);
                }
                Ok(())
            }
            None => {
                // Unknown RPC: if this RESEND named a server RPC we never
                // had, tell the peer to restart (§4.10).
                Metrics::incr(&self.metrics.unknown_rpc_drops);
                let peer = self.peers.find(src_addr, &self.config)?;
                let restart_header = CommonHeader::new(socket.port, header.sport, PacketType::Restart, 0, id);
                let bytes = encode_packet(&restart_header, &Packet::Restart(RestartPayload));
                if self.send_datagram_counted(&peer.route, 0, bytes).await {
                    Metrics::incr(&self.metrics.restarts_sent);
                }
                Ok(())
            }
        }
    }

    async fn handle_restart(&self, socket: &Arc<Socket>, header: &CommonHeader) -> Result<(), TransportError> {
        let id = header.id;
        socket.rpcs.with_client(&self.metrics, id, |maybe| {
            if let Some(rpc) = maybe {
                if let Some(out) = rpc.outbound.as_mut() {
                    out.reset_for_restart(&self.config);
                }
                rpc.state = State::Outgoing;
                rpc.inbound = None;
                rpc.received_since_tick = true;
            }
        });
        self.transmit_available(socket, Role::Client, id).await
    }

    fn handle_busy(&self, socket: &Arc<Socket>, header: &CommonHeader) -> Result<(), TransportError> {
        let id = header.id;
        socket.rpcs.with_client(&self.metrics, id, |maybe| {
            if let Some(rpc) = maybe {
                rpc.received_since_tick = true;
            }
        });
        socket.rpcs.with_server(&self.metrics, id, |maybe| {
            if let Some(rpc) = maybe {
                rpc.received_since_tick = true;
            }
        });
        Ok(())
    }

    fn handle_cutoffs(&self, src_addr: Ipv4Addr, payload: CutoffsPayload) -> Result<(), TransportError> {
        let peer = self.peers.find(src_addr, &self.config)?;
        *peer.unsched_cutoffs.write().expect("peer cutoffs poisoned") = payload.unsched_cutoffs.to_vec();
        peer.cutoff_version.store(payload.cutoff_version as u32, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Hands a datagram to the substrate, counting and logging failure
    /// rather than aborting the caller's loop (§7): a single bad send
    /// shouldn't stop the rest of a grant pass, pacer drain, or timer
    /// scan over unrelated RPCs/sockets. Returns whether the send
    /// succeeded.
    async fn send_datagram_counted(&self, route: &RouteHandle, priority: u8, bytes: Vec<u8>) -> bool {
        match self.substrate.send_datagram(route, priority, bytes).await {
            Ok(()) => true,
            Err(err) => {
                warn!(?err, "datagram send failed");
                Metrics::incr(&self.metrics.transmit_errors);
                false
            }
        }
    }

    // ---------------------------------------------------------------
    // Grant scheduler (C7)
    // ---------------------------------------------------------------

    fn update_grantable(&self, rpc: &mut Rpc) {
        let key = rpc.key();
        if let Some(inbound) = &rpc.inbound {
            let should_be_in = inbound.scheduled && inbound.bytes_remaining > 0 && inbound.incoming < inbound.length;
            if should_be_in {
                self.grantable.upsert(&self.metrics, key, inbound.bytes_remaining);
                rpc.in_grantable = true;
                return;
            }
        }
        if rpc.in_grantable {
            self.grantable.remove(&self.metrics, key);
            rpc.in_grantable = false;
        }
    }

    async fn run_grant_pass(&self) -> Result<(), TransportError> {
        let candidates = self.grantable.top_n(&self.metrics, self.config.max_overcommit);
        for (rank, key) in candidates.into_iter().enumerate() {
            let priority = self.config.max_sched_prio.saturating_sub(rank) as u8;
            let socket = match self.sockets.lookup(key.port) {
                Some(s) => s,
                None => continue,
            };
            let role = if key.role_is_server { Role::Server } else { Role::Client };
            let grant_info = socket.rpcs.with_role(&self.metrics, role, key.id, |maybe| {
                let rpc = maybe?;
                let inbound = rpc.inbound.as_mut()?;
                let next = next_grant_offset(inbound.incoming, inbound.bytes_remaining, inbound.length, self.config.rtt_bytes, self.config.grant_increment)?;
                inbound.observe_incoming(0, next as u32, 0);
                let should_remain = inbound.bytes_remaining > 0 && inbound.incoming < inbound.length;
                if !should_remain {
                    rpc.in_grantable = false;
                }
                Some((rpc.peer.route.clone(), rpc.dport, rpc.sport, next as u32, should_remain, inbound.bytes_remaining))
            });
            if let Some((route, dport, sport, offset, should_remain, bytes_remaining)) = grant_info {
                if should_remain {
                    self.grantable.upsert(&self.metrics, key, bytes_remaining);
                } else {
                    self.grantable.remove(&self.metrics, key);
                }
                let header = CommonHeader::new(sport, dport, PacketType::Grant, priority, key.id);
                let grant_payload = Packet::Grant(GrantPayload { offset, priority });
                let bytes = encode_packet(&header, &grant_payload);
                if self.send_datagram_counted(&route, priority, bytes).await {
                    Metrics::incr(&self.metrics.grants_sent);
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Pacer (C8)
    // ---------------------------------------------------------------

    /// Sends as many ready segments of this RPC's outbound message as the
    /// modeled NIC allows; parks the RPC on the throttled set once the
    /// queue is over cap (§4.5, §4.8).
    async fn transmit_available(&self, socket: &Arc<Socket>, role: Role, id: u64) -> Result<(), TransportError> {
        loop {
            let peek = socket.rpcs.with_role(&self.metrics, role, id, |maybe| {
                let rpc = maybe?;
                let out = rpc.outbound.as_ref()?;
                if !out.has_sendable() {
                    return None;
                }
                let end = (out.next + MAX_PKT_DATA).min(out.granted).min(out.length);
                if end <= out.next {
                    return None;
                }
                Some((end - out.next, out.remaining(), rpc.peer.route.clone(), rpc.dport, rpc.sport))
            });
            let (seg_len, remaining, route, dport, sport) = match peek {
                Some(v) => v,
                None => break,
            };
            let cost = packet_cost_ns(seg_len, 1, self.config.link_mbps);
            let now = self.substrate.now_ticks();
            let force = remaining < self.config.throttle_min_bytes;
            if !self.link_idle.try_reserve(now, cost, self.config.max_nic_queue_cycles(), force) {
                let key = RpcKey::new(sport, role, id);
                self.throttled.upsert(&self.metrics, key, remaining);
                socket.rpcs.with_role(&self.metrics, role, id, |maybe| {
                    if let Some(rpc) = maybe {
                        rpc.in_throttled = true;
                    }
                });
                Metrics::incr(&self.metrics.throttle_entries);
                self.substrate.wake();
                break;
            }
            let committed = socket.rpcs.with_role(&self.metrics, role, id, |maybe| {
                let rpc = maybe?;
                let out = rpc.outbound.as_mut()?;
                let seg = out.take_next_segment(MAX_PKT_DATA)?;
                let priority = out.priority_for_offset(seg.offset as usize, &rpc.peer, &self.config);
                Some((seg, priority, out.length as u32, out.granted as u32, out.is_complete()))
            });
            let (seg, priority, length, granted, complete) = match committed {
                Some(v) => v,
                None => break,
            };
            let _ = dport;
            let header = CommonHeader::new(sport, dport, PacketType::Data, priority, id);
            let offset = seg.offset;
            let data_payload = Packet::Data(DataPayload {
                message_length: length,
                incoming: granted,
                cutoff_version: 0,
                retransmit: false,
                segments: vec![seg],
            });
            let bytes = encode_packet(&header, &data_payload);
            if self.send_datagram_counted(&route, priority, bytes).await {
                debug!(id, offset, "sent DATA segment");
            }
            if complete {
                self.finish_outbound(socket, role, id).await;
            }
        }
        Ok(())
    }

    async fn finish_outbound(&self, socket: &Arc<Socket>, role: Role, id: u64) {
        match role {
            Role::Client => {
                // The client's outbound is the request; it stays OUTGOING
                // until the server's first DATA arrives (handled in
                // `handle_data`).
            }
            Role::Server => {
                socket.rpcs.with_server(&self.metrics, id, |maybe| {
                    if let Some(rpc) = maybe {
                        rpc.mark_dead();
                    }
                });
                socket.push_ready(RpcKey::new(socket.port, Role::Server, id));
            }
        }
    }

    fn spawn_pacer_task(self: Arc<Self>) {
        tokio::spawn(async move {
            const MAX_ITERATIONS_PER_WAKE: usize = 64;
            loop {
                tokio::time::sleep(Duration::from_micros(50)).await;
                let guard = match self.pacer_flag.try_enter() {
                    Some(g) => g,
                    None => continue,
                };
                for _ in 0..MAX_ITERATIONS_PER_WAKE {
                    let key = match self.throttled.pop_shortest(&self.metrics) {
                        Some(k) => k,
                        None => break,
                    };
                    let socket = match self.sockets.lookup(key.port) {
                        Some(s) => s,
                        None => continue,
                    };
                    let role = if key.role_is_server { Role::Server } else { Role::Client };
                    if let Err(err) = self.force_send_one(&socket, role, key.id).await {
                        warn!(?err, "pacer transmit failed");
                    }
                    tokio::task::yield_now().await;
                }
                drop(guard);
            }
        });
    }

    /// Sends exactly one packet for `id` unconditionally (`force=true`),
    /// then re-parks the RPC on the throttled set if it still has more
    /// granted-but-unsent data (§4.8's pacer loop body).
    async fn force_send_one(&self, socket: &Arc<Socket>, role: Role, id: u64) -> Result<(), TransportError> {
        let committed = socket.rpcs.with_role(&self.metrics, role, id, |maybe| {
            let rpc = maybe?;
            let out = rpc.outbound.as_mut()?;
            let seg = out.take_next_segment(MAX_PKT_DATA)?;
            let priority = out.priority_for_offset(seg.offset as usize, &rpc.peer, &self.config);
            Some((rpc.peer.route.clone(), rpc.dport, rpc.sport, seg, priority, out.length as u32, out.granted as u32, out.remaining(), out.has_sendable(), out.is_complete()))
        });
        let (route, dport, sport, seg, priority, length, granted, remaining, has_more, complete) = match committed {
            Some(v) => v,
            None => return Ok(()),
        };
        let now = self.substrate.now_ticks();
        let cost = packet_cost_ns(seg.bytes.len(), 1, self.config.link_mbps);
        self.link_idle.try_reserve(now, cost, self.config.max_nic_queue_cycles(), true);
        let header = CommonHeader::new(sport, dport, PacketType::Data, priority, id);
        let payload = Packet::Data(DataPayload { message_length: length, incoming: granted, cutoff_version: 0, retransmit: false, segments: vec![seg] });
        let bytes = encode_packet(&header, &payload);
        self.send_datagram_counted(&route, priority, bytes).await;
        if has_more {
            self.throttled.upsert(&self.metrics, RpcKey::new(sport, role, id), remaining);
        }
        if complete {
            self.finish_outbound(socket, role, id).await;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Timer/resend (C9)
    // ---------------------------------------------------------------

    fn spawn_timer_task(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                self.substrate.schedule_task(Duration::from_millis(1)).await;
                if let Err(err) = self.on_timer_tick().await {
                    warn!(?err, "timer tick failed");
                }
            }
        });
    }

    pub async fn on_timer_tick(&self) -> Result<(), TransportError> {
        let now = self.substrate.now_ticks();
        for socket in self.sockets.scan_snapshot() {
            socket.begin_scan();
            let mut actions = Vec::new();
            socket.rpcs.for_each_active(&self.metrics, |rpc| {
                let peer = rpc.peer.clone();
                let resend_interval = self.config.resend_interval as u64;
                let due = move || {
                    let last = peer.last_resend_tick.load(std::sync::atomic::Ordering::Relaxed) as u64;
                    now.saturating_sub(last) >= resend_interval
                };
                let gap = rpc.inbound.as_ref().and_then(|i| i.first_gap());
                if let Some(action) = crate::timer::evaluate_tick(rpc, &self.config, due, gap) {
                    if matches!(action, crate::timer::TimerAction::Resend { .. }) {
                        rpc.peer.last_resend_tick.store(now as u32, std::sync::atomic::Ordering::Relaxed);
                    }
                    actions.push((action, rpc.peer.route.clone(), rpc.dport, rpc.sport, rpc.key()));
                }
            });
            socket.end_scan();
            for (action, route, dport, sport, key) in actions {
                match action {
                    crate::timer::TimerAction::Resend { offset, length, .. } => {
                        let priority = self.config.max_sched_prio as u8;
                        let header = CommonHeader::new(sport, dport, PacketType::Resend, priority, key.id);
                        let payload = Packet::Resend(ResendPayload { offset, length, priority });
                        let bytes = encode_packet(&header, &payload);
                        if self.send_datagram_counted(&route, priority, bytes).await {
                            Metrics::incr(&self.metrics.resends_sent);
                        }
                    }
                    crate::timer::TimerAction::Abort { .. } => {
                        self.grantable.remove(&self.metrics, key);
                        self.throttled.remove(&self.metrics, key);
                        Metrics::incr(&self.metrics.rpcs_aborted_timeout);
                        socket.push_ready(key);
                    }
                }
            }
            self.reap(&socket);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // RPC lifecycle (C10)
    // ---------------------------------------------------------------

    fn reap(&self, socket: &Arc<Socket>) {
        if socket.reap_is_disabled() {
            return;
        }
        let dead = socket.rpcs.drain_dead(&self.metrics, self.config.reap_limit);
        for _ in dead {
            Metrics::incr(&self.metrics.rpcs_reaped);
        }
    }
}

/// Owned version of a [`crate::wire::DataSegment`] plus the bookkeeping
/// `handle_resend` needs to build the retransmitted DATA packet, without
/// re-borrowing the `Outbound` it came from.
struct DataSegmentOwned {
    offset: u32,
    bytes: Vec<u8>,
    length: usize,
    incoming: u32,
}
