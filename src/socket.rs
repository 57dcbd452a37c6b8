//! Socket registry (C3) and the `Socket` itself.
//!
//! Grounded on the teacher's `tcp.rs` listener/port-binding flow
//! (`NFSTcpListener::bind`, `generate_host_ip`) for the explicit-bind
//! style, and on `rpc::Context`'s `RwLock`-guarded table pattern for the
//! registry; data fields grounded on `examples/original_source/
//! homa_impl.h`'s `struct homa_sock` / `struct homa_socktab`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::HOMA_MIN_CLIENT_PORT;
use crate::error::TransportError;
use crate::rpc::{RpcKey, RpcRegistry};

/// Which side of a socket a caller wants to wait for (§6 `recv`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Request,
    Response,
    Any,
    Specific(u64),
}

pub struct Socket {
    pub port: u16,
    /// `Some` if this socket was bound to receive server requests.
    pub server_port: Option<u16>,
    pub rpcs: RpcRegistry,
    next_client_id: AtomicU64,
    /// Non-zero while a scanner (the timer) is traversing this socket's
    /// RPCs without holding a registry-wide lock — the RCU substitution
    /// named in §5/§9.
    pub reap_disable: AtomicU32,
    ready: Mutex<VecDeque<RpcKey>>,
    notify: Notify,
}

impl Socket {
    fn new(port: u16, server_port: Option<u16>) -> Self {
        Socket {
            port,
            server_port,
            rpcs: RpcRegistry::new(),
            next_client_id: AtomicU64::new(1),
            reap_disable: AtomicU32::new(0),
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn alloc_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Marks an RPC as ready for the application to consume and wakes any
    /// blocked `recv`.
    pub fn push_ready(&self, key: RpcKey) {
        self.ready.lock().expect("ready queue poisoned").push_back(key);
        self.notify.notify_waiters();
    }

    /// Removes and returns the next ready RPC matching `want`, if any is
    /// already queued (non-blocking half of `recv`).
    pub fn pop_ready(&self, want: Want) -> Option<RpcKey> {
        let mut queue = self.ready.lock().expect("ready queue poisoned");
        let pos = queue.iter().position(|key| Self::matches(*key, want))?;
        queue.remove(pos)
    }

    fn matches(key: RpcKey, want: Want) -> bool {
        match want {
            Want::Request => key.role_is_server,
            Want::Response => !key.role_is_server,
            Want::Any => true,
            Want::Specific(id) => key.id == id,
        }
    }

    /// Waits until a matching RPC becomes ready, rechecking after each
    /// wake (an RPC for someone else may have arrived first).
    pub async fn wait_ready(&self, want: Want) -> RpcKey {
        loop {
            if let Some(key) = self.pop_ready(want) {
                return key;
            }
            self.notified().await;
        }
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn begin_scan(&self) {
        self.reap_disable.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_scan(&self) {
        self.reap_disable.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn reap_is_disabled(&self) -> bool {
        self.reap_disable.load(Ordering::Acquire) > 0
    }
}

/// Port -> socket mapping (§4.3). Lookups read-lock only; modifications
/// take the single registry-wide write mutex.
#[derive(Default)]
pub struct SocketRegistry {
    sockets: RwLock<HashMap<u16, Arc<Socket>>>,
    next_client_port: AtomicU16,
}

impl SocketRegistry {
    pub fn new() -> Self {
        SocketRegistry {
            sockets: RwLock::new(HashMap::new()),
            next_client_port: AtomicU16::new(HOMA_MIN_CLIENT_PORT),
        }
    }

    pub fn lookup(&self, port: u16) -> Option<Arc<Socket>> {
        self.sockets.read().expect("socket registry poisoned").get(&port).cloned()
    }

    /// Binds a server socket to an application-chosen port.
    pub fn bind_server(&self, port: u16) -> Result<Arc<Socket>, TransportError> {
        if port == 0 || port >= HOMA_MIN_CLIENT_PORT {
            return Err(TransportError::ResourceExhausted { reason: "server port out of range" });
        }
        let mut guard = self.sockets.write().expect("socket registry poisoned");
        if guard.contains_key(&port) {
            return Err(TransportError::ResourceExhausted { reason: "server port already bound" });
        }
        let socket = Arc::new(Socket::new(port, Some(port)));
        info!(port, "bound server socket");
        guard.insert(port, socket.clone());
        Ok(socket)
    }

    /// Allocates a fresh client socket from the monotone counter above the
    /// server range, skipping ports already in use.
    pub fn bind_client(&self) -> Arc<Socket> {
        let mut guard = self.sockets.write().expect("socket registry poisoned");
        loop {
            let port = self.next_client_port.fetch_add(1, Ordering::Relaxed);
            let port = if port == 0 { self.next_client_port.fetch_add(1, Ordering::Relaxed) } else { port };
            if !guard.contains_key(&port) {
                let socket = Arc::new(Socket::new(port, None));
                debug!(port, "bound client socket");
                guard.insert(port, socket.clone());
                return socket;
            }
        }
    }

    pub fn remove(&self, port: u16) -> Option<Arc<Socket>> {
        self.sockets.write().expect("socket registry poisoned").remove(&port)
    }

    /// A restart-safe snapshot for the periodic timer: a clone of every
    /// live socket `Arc` at the moment of the call. Because each entry is
    /// an `Arc`, a concurrent removal from the registry can't invalidate
    /// an entry already handed to the scanner, and no entry appears twice.
    pub fn scan_snapshot(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().expect("socket registry poisoned").values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_bind_rejects_duplicate_port() {
        let registry = SocketRegistry::new();
        registry.bind_server(99).unwrap();
        let err = registry.bind_server(99).unwrap_err();
        assert!(matches!(err, TransportError::ResourceExhausted { .. }));
    }

    #[test]
    fn client_ports_are_disjoint_from_server_range() {
        let registry = SocketRegistry::new();
        let client = registry.bind_client();
        assert!(client.port >= HOMA_MIN_CLIENT_PORT);
    }

    #[test]
    fn ready_queue_matches_want() {
        let registry = SocketRegistry::new();
        let socket = registry.bind_server(50).unwrap();
        let key = RpcKey::new(50, crate::rpc::Role::Server, 7);
        socket.push_ready(key);
        assert_eq!(socket.pop_ready(Want::Request), Some(key));
        assert_eq!(socket.pop_ready(Want::Request), None);
    }
}
