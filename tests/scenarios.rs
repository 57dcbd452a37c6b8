//! End-to-end engine scenarios driven over the in-memory `FakeSubstrate`
//! (`support.rs`), matching the teacher's `tests/rpc.rs`-style integration
//! tests that exercise the whole stack through its public entry points
//! rather than individual modules.

mod support;

use std::net::Ipv4Addr;
use std::time::Duration;

use homa_core::config::Config;
use homa_core::rpc::RpcError;
use homa_core::socket::Want;
use homa_core::wire::{decode_packet, encode_packet, CommonHeader, DataPayload, DataSegment, Packet, PacketType, RestartPayload};
use homa_core::Engine;

use support::{pump, FakeSubstrate};

const ADDR_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const ADDR_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

#[tokio::test]
async fn small_rpc_completes_with_no_grants() {
    let (substrate_a, mut rx_a) = FakeSubstrate::new(ADDR_A);
    let (substrate_b, mut rx_b) = FakeSubstrate::new(ADDR_B);
    let engine_a = Engine::new(Config::default(), substrate_a);
    let engine_b = Engine::new(Config::default(), substrate_b);

    let socket_a = engine_a.bind_client();
    let socket_b = engine_b.bind_server(99).unwrap();

    let request_id = engine_a.send(&socket_a, ADDR_B, 99, vec![1u8; 1000]).await.unwrap();
    assert_eq!(pump(&engine_b, &socket_b, ADDR_A, &mut rx_a).await, 1, "request is a single DATA packet");

    let request = engine_b.recv(&socket_b, Want::Request).await;
    assert_eq!(request.id, request_id);
    assert_eq!(request.buffer, vec![1u8; 1000]);

    engine_b.reply(&socket_b, request_id, vec![2u8; 500]).await.unwrap();
    assert_eq!(pump(&engine_a, &socket_a, ADDR_B, &mut rx_b).await, 1, "reply is a single DATA packet");

    let response = engine_a.recv(&socket_a, Want::Response).await;
    assert_eq!(response.id, request_id);
    assert_eq!(response.buffer, vec![2u8; 500]);
    assert_eq!(response.error, None);

    assert_eq!(engine_a.metrics().snapshot().grants_sent, 0);
    assert_eq!(engine_b.metrics().snapshot().grants_sent, 0);
}

#[tokio::test]
async fn large_rpc_is_paced_out_by_grants() {
    // Unscheduled rounding normally rounds up to a whole GSO unit; picking
    // a GSO size equal to rtt_bytes keeps the unscheduled amount at exactly
    // rtt_bytes, matching the scenario's literal numbers. The NIC cap is
    // widened so this test exercises grant pacing, not link pacing (that's
    // its own scenario below).
    let config = Config { max_gso_size: 10_000, max_nic_queue_ns: 10_000_000, ..Config::default() };
    let (substrate_a, mut rx_a) = FakeSubstrate::new(ADDR_A);
    let (substrate_b, mut rx_b) = FakeSubstrate::new(ADDR_B);
    let engine_a = Engine::new(config.clone(), substrate_a);
    let engine_b = Engine::new(config, substrate_b);

    let socket_a = engine_a.bind_client();
    let socket_b = engine_b.bind_server(99).unwrap();

    let id = engine_a.send(&socket_a, ADDR_B, 99, vec![5u8; 100_000]).await.unwrap();

    for _ in 0..50 {
        let a_to_b = pump(&engine_b, &socket_b, ADDR_A, &mut rx_a).await;
        let b_to_a = pump(&engine_a, &socket_a, ADDR_B, &mut rx_b).await;
        if a_to_b == 0 && b_to_a == 0 {
            break;
        }
    }

    let request = engine_b.recv(&socket_b, Want::Request).await;
    assert_eq!(request.id, id);
    assert_eq!(request.buffer.len(), 100_000);
    assert!(request.buffer.iter().all(|&b| b == 5));

    // 10,000 unscheduled, then one grant per 10,000-byte step up to 100,000.
    assert_eq!(engine_b.metrics().snapshot().grants_sent, 9);
}

#[tokio::test]
async fn lost_segment_triggers_resend_then_completes() {
    let config = Config::default();
    let (substrate, mut rx) = FakeSubstrate::new(ADDR_B);
    let engine = Engine::new(config, substrate.clone());
    let socket = engine.bind_server(77).unwrap();

    const CLIENT_PORT: u16 = 0x9000;
    const ID: u64 = 55;
    const LEN: u32 = 5760;

    let deliver = |offset: u32, bytes: Vec<u8>| {
        let header = CommonHeader::new(CLIENT_PORT, 77, PacketType::Data, 0, ID);
        let payload = Packet::Data(DataPayload {
            message_length: LEN,
            incoming: LEN,
            cutoff_version: 0,
            retransmit: false,
            segments: vec![DataSegment { offset, bytes }],
        });
        encode_packet(&header, &payload)
    };

    engine.deliver_packet(&socket, ADDR_A, &deliver(0, vec![1u8; 1440])).await.unwrap();
    engine.deliver_packet(&socket, ADDR_A, &deliver(4320, vec![2u8; 1440])).await.unwrap();

    for _ in 0..6 {
        substrate.advance(2);
        engine.on_timer_tick().await.unwrap();
    }

    let resend_bytes = rx.try_recv().expect("a RESEND should have been emitted for the gap");
    let (_, resend_packet) = decode_packet(ADDR_B, &resend_bytes.bytes).unwrap();
    match resend_packet {
        Packet::Resend(p) => {
            assert_eq!(p.offset, 1440);
            assert_eq!(p.length, 2880);
        }
        other => panic!("expected a RESEND packet, got {other:?}"),
    }

    engine.deliver_packet(&socket, ADDR_A, &deliver(1440, vec![3u8; 2880])).await.unwrap();

    let request = engine.recv(&socket, Want::Request).await;
    assert_eq!(request.id, ID);
    assert_eq!(&request.buffer[0..1440], &vec![1u8; 1440][..]);
    assert_eq!(&request.buffer[1440..4320], &vec![3u8; 2880][..]);
    assert_eq!(&request.buffer[4320..5760], &vec![2u8; 1440][..]);
}

#[tokio::test]
async fn resend_for_unknown_rpc_triggers_restart_and_client_retransmits() {
    // Side A never had RPC 42 (e.g. it restarted); a RESEND naming it
    // should come back as a RESTART rather than silently drop.
    let (substrate_a, mut rx_a) = FakeSubstrate::new(ADDR_A);
    let engine_a = Engine::new(Config::default(), substrate_a);
    let socket_a = engine_a.bind_server(88).unwrap();

    let resend_header = CommonHeader::new(0x9001, 88, PacketType::Resend, 0, 42);
    let resend_payload = Packet::Resend(homa_core::wire::ResendPayload { offset: 0, length: 100, priority: 0 });
    let resend_bytes = encode_packet(&resend_header, &resend_payload);
    engine_a.deliver_packet(&socket_a, ADDR_B, &resend_bytes).await.unwrap();

    let restart_bytes = rx_a.try_recv().expect("unknown rpc should provoke a RESTART");
    let (_, restart_packet) = decode_packet(ADDR_A, &restart_bytes.bytes).unwrap();
    assert_eq!(restart_packet, Packet::Restart(RestartPayload));
    assert_eq!(engine_a.metrics().snapshot().unknown_rpc_drops, 1);

    // Side B has a real outstanding client RPC; delivering RESTART to it
    // resets msgout and re-sends from offset 0.
    let (substrate_b, mut rx_b) = FakeSubstrate::new(ADDR_B);
    let engine_b = Engine::new(Config::default(), substrate_b);
    let socket_b = engine_b.bind_client();
    let id = engine_b.send(&socket_b, ADDR_A, 88, vec![9u8; 50_000]).await.unwrap();
    // Drain whatever was sent before the restart so only post-restart
    // traffic remains to inspect.
    while rx_b.try_recv().is_ok() {}

    let restart_header = CommonHeader::new(88, socket_b.port, PacketType::Restart, 0, id);
    let restart_bytes = encode_packet(&restart_header, &Packet::Restart(RestartPayload));
    engine_b.deliver_packet(&socket_b, ADDR_A, &restart_bytes).await.unwrap();

    let first_retransmit = rx_b.try_recv().expect("restart should re-trigger a send");
    let (_, data_packet) = decode_packet(ADDR_B, &first_retransmit.bytes).unwrap();
    match data_packet {
        Packet::Data(p) => assert_eq!(p.segments[0].offset, 0),
        other => panic!("expected a DATA packet, got {other:?}"),
    }
}

#[tokio::test]
async fn pacer_drains_shorter_message_first() {
    let config = Config {
        rtt_bytes: 1_000_000,
        max_gso_size: 1_000_000,
        max_nic_queue_ns: 1,
        throttle_min_bytes: 0,
        ..Config::default()
    };
    let (substrate, mut rx) = FakeSubstrate::new(ADDR_A);
    let engine = Engine::new(config, substrate);
    let socket = engine.bind_client();

    let id_long = engine.send(&socket, ADDR_A, 1, vec![7u8; 30_000]).await.unwrap();
    let id_short = engine.send(&socket, ADDR_B, 2, vec![9u8; 5_000]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut ids_in_order = Vec::new();
    while let Ok(dg) = rx.try_recv() {
        let (header, _) = decode_packet(ADDR_A, &dg.bytes).unwrap();
        ids_in_order.push(header.id);
    }

    assert_eq!(ids_in_order[0], id_long, "the long message's first packet is sent synchronously before anything throttles");
    let last_short = ids_in_order.iter().rposition(|&id| id == id_short).expect("short message should have sent");
    let second_long = ids_in_order.iter().enumerate().filter(|&(_, &id)| id == id_long).nth(1).map(|(i, _)| i).expect("long message should resume after being throttled");
    assert!(last_short < second_long, "pacer should drain the shorter message before resuming the longer one");

    let short_count = ids_in_order.iter().filter(|&&id| id == id_short).count();
    assert_eq!(short_count, 4); // ceil(5000 / 1440)
}

#[tokio::test]
async fn timeout_aborts_and_recv_surfaces_the_error() {
    let config = Config { resend_ticks: 1, resend_interval: 1, abort_resends: 2, ..Config::default() };
    let (substrate, _rx) = FakeSubstrate::new(ADDR_A);
    let engine = Engine::new(config, substrate.clone());
    let socket = engine.bind_client();

    let id = engine.send(&socket, ADDR_B, 9, vec![1u8; 100]).await.unwrap();

    for _ in 0..3 {
        substrate.advance(2);
        engine.on_timer_tick().await.unwrap();
    }

    let result = engine.recv(&socket, Want::Specific(id)).await;
    assert_eq!(result.id, id);
    assert_eq!(result.error, Some(RpcError::Timeout));
    assert_eq!(engine.metrics().snapshot().rpcs_aborted_timeout, 1);
}
