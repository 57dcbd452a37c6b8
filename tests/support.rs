//! In-memory test substrate (§10.5): a channel-backed `PacketSubstrate`
//! so engine-level scenarios can run without real IP sockets. Modeled on
//! the teacher's `DemoFS` fake (`tests/support.rs`): a tiny struct
//! implementing the embedder trait with just enough behavior for tests
//! to drive deterministically.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use homa_core::error::TransportError;
use homa_core::peer::RouteHandle;
use homa_core::socket::Socket;
use homa_core::{Engine, PacketSubstrate};

/// One packet handed to [`FakeSubstrate::send_datagram`], captured for the
/// test to either inspect directly or hand to the other side's engine.
pub struct Datagram {
    pub priority: u8,
    pub bytes: Vec<u8>,
}

/// A destination's packet I/O, modeled as an outbound channel. Unlike a
/// real substrate there is no implicit delivery: the test drives when a
/// queued datagram reaches the other engine, via [`pump`].
pub struct FakeSubstrate {
    pub addr: Ipv4Addr,
    outbox: mpsc::UnboundedSender<Datagram>,
    now: AtomicU64,
}

impl FakeSubstrate {
    pub fn new(addr: Ipv4Addr) -> (Arc<Self>, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(FakeSubstrate { addr, outbox: tx, now: AtomicU64::new(0) }), rx)
    }

    /// Advances the engine's tick clock, the only driver of `resend_ticks`/
    /// `resend_interval` comparisons in tests (real wall-clock time is
    /// irrelevant to those invariants).
    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::Relaxed);
    }
}

#[async_trait]
impl PacketSubstrate for FakeSubstrate {
    async fn send_datagram(&self, _route: &RouteHandle, priority: u8, bytes: Vec<u8>) -> Result<(), TransportError> {
        let _ = self.outbox.send(Datagram { priority, bytes });
        Ok(())
    }

    fn now_ticks(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    /// Tests drive the timer via [`Engine::on_timer_tick`] directly, so
    /// the background timer task is simply parked for the test's lifetime
    /// rather than racing it on real wall-clock time.
    async fn schedule_task(&self, _delay: Duration) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }

    fn wake(&self) {}
}

/// Delivers every datagram currently queued in `rx` to `dst_socket` on
/// `dst_engine`, as if it had just arrived from `src_addr`. Returns the
/// number of datagrams delivered.
pub async fn pump(
    dst_engine: &Arc<Engine<FakeSubstrate>>,
    dst_socket: &Arc<Socket>,
    src_addr: Ipv4Addr,
    rx: &mut mpsc::UnboundedReceiver<Datagram>,
) -> usize {
    let mut delivered = 0;
    while let Ok(dg) = rx.try_recv() {
        let _ = dst_engine.deliver_packet(dst_socket, src_addr, &dg.bytes).await;
        delivered += 1;
    }
    delivered
}
