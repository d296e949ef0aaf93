//! Per-upstream-server bookkeeping: socket state, pending-request sets and
//! idle-timeout management.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::Message;
use crate::constants::{IDLE_SWEEP_INTERVAL, SERVER_IDLE_TIMEOUT};
use crate::error::{ResolveError, Result};
use crate::request::RequestTable;
use crate::transport::tcp::TcpConn;
use crate::transport::udp::UdpMultiplexer;

pub const PROTO_UDP: u8 = 0b01;
pub const PROTO_TCP: u8 = 0b10;
pub const PROTO_ANY: u8 = PROTO_UDP | PROTO_TCP;

/// TCP state of one server entry. A dial in progress holds the slot lock,
/// which doubles as the pending-connect queue.
pub(crate) enum TcpSlot {
    Idle,
    Established(TcpConn),
    Failed,
}

/// Resolver-side bookkeeping for one upstream endpoint.
pub struct ServerEntry {
    addr: SocketAddr,
    protocols: u8,
    tcp_failed: AtomicBool,
    udp_proven: AtomicBool,
    /// Single-permit gate serializing the first UDP contact.
    probe: Arc<Semaphore>,
    pub(crate) tcp: tokio::sync::Mutex<TcpSlot>,
    pending: Mutex<HashSet<u16>>,
    idle_at: Mutex<Option<Instant>>,
}

impl ServerEntry {
    fn new(addr: SocketAddr, protocols: u8) -> Self {
        Self {
            addr,
            protocols,
            tcp_failed: AtomicBool::new(false),
            udp_proven: AtomicBool::new(false),
            probe: Arc::new(Semaphore::new(1)),
            tcp: tokio::sync::Mutex::new(TcpSlot::Idle),
            pending: Mutex::new(HashSet::new()),
            // An unused entry sits in its idle window from the start.
            idle_at: Mutex::new(Some(Instant::now() + SERVER_IDLE_TIMEOUT)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn protocols(&self) -> u8 {
        self.protocols
    }

    pub fn tcp_failed(&self) -> bool {
        self.tcp_failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_tcp_failed(&self) {
        self.tcp_failed.store(true, Ordering::Release);
    }

    pub fn udp_proven(&self) -> bool {
        self.udp_proven.load(Ordering::Acquire)
    }

    pub(crate) fn mark_udp_proven(&self) {
        self.udp_proven.store(true, Ordering::Release);
    }

    /// First-contact gate: until the server has answered once over UDP, only
    /// one datagram may be outstanding. The first sender gets a permit held
    /// for the duration of its exchange; everyone else waits here for the
    /// probe to settle. Once the server is proven the gate stays open.
    pub(crate) async fn udp_gate(&self) -> Option<OwnedSemaphorePermit> {
        if self.udp_proven() {
            return None;
        }
        match self.probe.clone().acquire_owned().await {
            Ok(permit) if !self.udp_proven() => Some(permit),
            _ => None,
        }
    }

    pub(crate) fn add_pending(&self, id: u16) {
        self.pending.lock().insert(id);
        *self.idle_at.lock() = None;
    }

    pub(crate) fn remove_pending(&self, id: u16) {
        let mut pending = self.pending.lock();
        if pending.remove(&id) && pending.is_empty() {
            *self.idle_at.lock() = Some(Instant::now() + SERVER_IDLE_TIMEOUT);
        }
    }

    pub(crate) fn drain_pending(&self) -> Vec<u16> {
        let mut pending = self.pending.lock();
        let drained: Vec<u16> = pending.drain().collect();
        *self.idle_at.lock() = Some(Instant::now() + SERVER_IDLE_TIMEOUT);
        drained
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn idle_expired(&self) -> bool {
        if !self.pending.lock().is_empty() {
            return false;
        }
        matches!(*self.idle_at.lock(), Some(at) if at <= Instant::now())
    }

    /// Whether a TCP connection is established right now. A slot whose lock
    /// is held (a dial in progress) counts as not established.
    pub(crate) fn tcp_established_now(&self) -> bool {
        match self.tcp.try_lock() {
            Ok(slot) => matches!(&*slot, TcpSlot::Established(_)),
            Err(_) => false,
        }
    }

    pub(crate) fn tcp_idle_now(&self) -> bool {
        match self.tcp.try_lock() {
            Ok(slot) => matches!(&*slot, TcpSlot::Idle),
            Err(_) => false,
        }
    }

    pub(crate) async fn teardown_tcp(&self) {
        let mut slot = self.tcp.lock().await;
        if let TcpSlot::Established(conn) = &*slot {
            conn.abort();
            *slot = TcpSlot::Idle;
        }
    }
}

/// The set of loaded upstream servers plus the shared UDP sockets and the
/// idle sweeper that unloads servers whose pending sets stay empty.
pub struct ServerRegistry {
    servers: Arc<DashMap<SocketAddr, Arc<ServerEntry>>>,
    requests: Arc<RequestTable>,
    udp: UdpMultiplexer,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ServerRegistry {
    pub async fn bind(requests: Arc<RequestTable>) -> Result<Arc<Self>> {
        let servers = Arc::new(DashMap::new());
        let udp = UdpMultiplexer::bind(servers.clone(), requests.clone()).await?;
        Ok(Arc::new(Self {
            servers,
            requests,
            udp,
            sweeper: Mutex::new(None),
        }))
    }

    pub fn udp(&self) -> &UdpMultiplexer {
        &self.udp
    }

    pub(crate) fn requests(&self) -> &RequestTable {
        &self.requests
    }

    pub(crate) fn requests_arc(&self) -> Arc<RequestTable> {
        self.requests.clone()
    }

    pub(crate) fn servers_arc(&self) -> Arc<DashMap<SocketAddr, Arc<ServerEntry>>> {
        self.servers.clone()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn is_loaded(&self, addr: SocketAddr) -> bool {
        self.servers.contains_key(&addr)
    }

    /// Look up or create the entry for `addr`. IPv6 endpoints are rejected
    /// when no IPv6 socket could be bound.
    pub fn get_or_load(
        self: &Arc<Self>,
        addr: SocketAddr,
        protocols: u8,
    ) -> Result<Arc<ServerEntry>> {
        if addr.is_ipv6() && !self.udp.has_v6() {
            return Err(ResolveError::Resolution(format!(
                "IPv6 transport unavailable for server {addr}"
            )));
        }
        let entry = self
            .servers
            .entry(addr)
            .or_insert_with(|| {
                debug!(server = %addr, "loading server");
                Arc::new(ServerEntry::new(addr, protocols))
            })
            .clone();
        self.ensure_sweeper();
        Ok(entry)
    }

    pub async fn unload(&self, addr: SocketAddr, reason: ResolveError) {
        unload_server(&self.servers, &self.requests, addr, reason).await;
    }

    /// Spawn the 1 Hz idle sweep if it is not already running. The task
    /// disables itself once the last server is unloaded.
    fn ensure_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                let expired: Vec<SocketAddr> = registry
                    .servers
                    .iter()
                    .filter(|entry| entry.value().idle_expired())
                    .map(|entry| *entry.key())
                    .collect();
                for addr in expired {
                    debug!(server = %addr, "unloading idle server");
                    registry
                        .unload(addr, ResolveError::Resolution(format!("Server {addr} unloaded")))
                        .await;
                }
                if registry.servers.is_empty() {
                    break;
                }
            }
        }));
    }
}

impl Drop for ServerRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        for entry in self.servers.iter() {
            if let Ok(slot) = entry.value().tcp.try_lock() {
                if let TcpSlot::Established(conn) = &*slot {
                    conn.abort();
                }
            }
        }
        self.udp.shutdown();
    }
}

/// Remove a server entirely: fail its pending requests and tear down its
/// sockets. Used for protocol faults and idle expiry.
pub(crate) async fn unload_server(
    servers: &DashMap<SocketAddr, Arc<ServerEntry>>,
    requests: &RequestTable,
    addr: SocketAddr,
    reason: ResolveError,
) {
    let Some((_, entry)) = servers.remove(&addr) else {
        return;
    };
    let pending = entry.drain_pending();
    if !pending.is_empty() {
        warn!(server = %addr, reason = %reason, count = pending.len(), "unloading server with pending requests");
    }
    for id in pending {
        if let Some(request) = requests.take(id) {
            let _ = request.tx.send(Err(reason.clone()));
        }
    }
    entry.teardown_tcp().await;
}

/// Fail everything outstanding on a server without removing the entry. The
/// entry then sits in its idle window until the sweeper collects it.
pub(crate) fn fail_pending(entry: &ServerEntry, requests: &RequestTable, reason: &ResolveError) {
    for id in entry.drain_pending() {
        if let Some(request) = requests.take(id) {
            let _ = request.tx.send(Err(reason.clone()));
        }
    }
}

/// Route one response buffer from `peer` back to its waiting request.
///
/// Returns true when a protocol fault unloaded the server: undecodable
/// payloads and non-response messages both condemn the whole connection.
pub(crate) async fn dispatch_response(
    servers: &DashMap<SocketAddr, Arc<ServerEntry>>,
    requests: &RequestTable,
    peer: SocketAddr,
    buf: &[u8],
) -> bool {
    let Some(entry) = servers.get(&peer).map(|entry| entry.value().clone()) else {
        trace!(peer = %peer, "response from unknown server, discarding");
        return false;
    };

    let message = match Message::decode(buf) {
        Ok(message) => message,
        Err(err) => {
            unload_server(
                servers,
                requests,
                peer,
                ResolveError::Resolution(format!("Malformed response from {peer}: {err}")),
            )
            .await;
            return true;
        }
    };

    if !message.is_response() {
        unload_server(
            servers,
            requests,
            peer,
            ResolveError::Resolution(format!("Unexpected non-response message from {peer}")),
        )
        .await;
        return true;
    }

    let id = message.header.id;
    // Responses for IDs we no longer track (cancelled or timed out) and
    // responses arriving from the wrong server are dropped silently.
    match requests.server_of(id) {
        Some(server) if server == peer => {}
        _ => {
            trace!(peer = %peer, id, "response for unknown request, discarding");
            return false;
        }
    }

    if let Some(request) = requests.take(id) {
        entry.remove_pending(id);
        trace!(peer = %peer, id, qname = %request.name, rtype = ?request.rtype, "response dispatched");
        let _ = request.tx.send(Ok(message));
    }
    false
}
