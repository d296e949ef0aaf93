//! Shared UDP sockets, one per address family.
//!
//! All upstream exchanges go through these two sockets; inbound datagrams
//! are demultiplexed back to their server entry by source address. Sends are
//! queued per family and drained FIFO by a writer task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::constants::MAX_UDP_PACKET_SIZE;
use crate::error::{ResolveError, Result};
use crate::registry::{ServerEntry, dispatch_response};
use crate::request::RequestTable;

pub struct UdpMultiplexer {
    v4_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    v6_tx: Option<mpsc::UnboundedSender<(SocketAddr, Bytes)>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpMultiplexer {
    /// Bind the per-family sockets. IPv4 failure is fatal; a failed IPv6
    /// bind is tolerated and IPv6 servers become unreachable.
    pub(crate) async fn bind(
        servers: Arc<DashMap<SocketAddr, Arc<ServerEntry>>>,
        requests: Arc<RequestTable>,
    ) -> Result<Self> {
        let v4 = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|err| ResolveError::Socket(Arc::new(err)))?;

        let mut tasks = Vec::new();
        let v4_tx = Self::start(Arc::new(v4), servers.clone(), requests.clone(), &mut tasks);
        let v6_tx = match UdpSocket::bind("[::]:0").await {
            Ok(socket) => Some(Self::start(Arc::new(socket), servers, requests, &mut tasks)),
            Err(err) => {
                warn!("IPv6 UDP socket unavailable: {err}");
                None
            }
        };

        Ok(Self {
            v4_tx,
            v6_tx,
            tasks,
        })
    }

    fn start(
        socket: Arc<UdpSocket>,
        servers: Arc<DashMap<SocketAddr, Arc<ServerEntry>>>,
        requests: Arc<RequestTable>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> mpsc::UnboundedSender<(SocketAddr, Bytes)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();

        let send_socket = socket.clone();
        tasks.push(tokio::spawn(async move {
            // FIFO drain; awaiting send_to stands in for a writability
            // watcher on the non-blocking socket.
            while let Some((dest, data)) = rx.recv().await {
                if let Err(err) = send_socket.send_to(&data, dest).await {
                    warn!(server = %dest, "UDP send failed: {err}");
                }
            }
        }));

        tasks.push(tokio::spawn(async move {
            let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, peer)) => {
                        trace!(peer = %peer, len, "UDP datagram received");
                        // Any reply proves the server reachable and lifts
                        // its first-contact gate.
                        if let Some(entry) = servers.get(&peer).map(|e| e.value().clone()) {
                            entry.mark_udp_proven();
                        }
                        dispatch_response(&servers, &requests, peer, &buf[..len]).await;
                    }
                    Err(err) => {
                        warn!("UDP receive failed: {err}");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));

        tx
    }

    pub fn has_v6(&self) -> bool {
        self.v6_tx.is_some()
    }

    pub(crate) fn send(&self, dest: SocketAddr, data: Bytes) -> Result<()> {
        let tx = match dest {
            SocketAddr::V4(_) => &self.v4_tx,
            SocketAddr::V6(_) => self.v6_tx.as_ref().ok_or_else(|| {
                ResolveError::Resolution(format!("IPv6 transport unavailable for server {dest}"))
            })?,
        };
        tx.send((dest, data))
            .map_err(|_| ResolveError::Resolution("UDP send queue closed".to_string()))
    }

    pub(crate) fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
