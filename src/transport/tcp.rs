//! Lazily-opened per-server TCP connection with 2-byte length framing.
//!
//! One stream multiplexes every outstanding request to its server. Connect
//! failure marks the server TCP-unusable; a closed stream fails everything
//! outstanding and leaves the slot free for a later redial.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::constants::TCP_CONNECT_TIMEOUT;
use crate::error::{ResolveError, Result};
use crate::registry::{ServerEntry, TcpSlot, dispatch_response, fail_pending};
use crate::request::RequestTable;

pub(crate) struct TcpConn {
    pub tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TcpConn {
    pub(crate) fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Return the established connection's write handle, dialing first if
/// needed. Waiters queue on the slot lock while a dial is in progress.
pub(crate) async fn ensure_conn(
    servers: &Arc<DashMap<SocketAddr, Arc<ServerEntry>>>,
    requests: &Arc<RequestTable>,
    entry: &Arc<ServerEntry>,
) -> Result<mpsc::UnboundedSender<Bytes>> {
    let addr = entry.addr();
    let mut slot = entry.tcp.lock().await;
    match &*slot {
        TcpSlot::Established(conn) => return Ok(conn.tx.clone()),
        TcpSlot::Failed => {
            return Err(ResolveError::Resolution(format!(
                "TCP to {addr} previously failed"
            )));
        }
        TcpSlot::Idle => {}
    }

    debug!(server = %addr, "opening TCP connection");
    let stream = match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            return Err(fail_connect(
                entry,
                requests,
                &mut slot,
                format!("TCP connect to {addr} failed: {err}"),
            ));
        }
        Err(_) => {
            return Err(fail_connect(
                entry,
                requests,
                &mut slot,
                format!("TCP connect to {addr} timed out"),
            ));
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let writer = tokio::spawn(async move {
        // Frames arrive pre-framed; writing them whole preserves FIFO order
        // on the stream.
        while let Some(frame) = rx.recv().await {
            if let Err(err) = write_half.write_all(&frame).await {
                debug!(server = %addr, "TCP write failed: {err}");
                break;
            }
        }
    });

    let reader = tokio::spawn(read_loop(
        read_half,
        servers.clone(),
        requests.clone(),
        entry.clone(),
    ));

    *slot = TcpSlot::Established(TcpConn {
        tx: tx.clone(),
        reader,
        writer,
    });
    Ok(tx)
}

fn fail_connect(
    entry: &ServerEntry,
    requests: &RequestTable,
    slot: &mut TcpSlot,
    message: String,
) -> ResolveError {
    entry.mark_tcp_failed();
    *slot = TcpSlot::Failed;
    let reason = ResolveError::Resolution(message);
    fail_pending(entry, requests, &reason);
    reason
}

/// Stateful inbound framer: each frame is a 2-byte big-endian length prefix
/// followed by one DNS message. Stream close fails everything outstanding.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    servers: Arc<DashMap<SocketAddr, Arc<ServerEntry>>>,
    requests: Arc<RequestTable>,
    entry: Arc<ServerEntry>,
) {
    let addr = entry.addr();
    loop {
        let mut length = [0u8; 2];
        if read_half.read_exact(&mut length).await.is_err() {
            break;
        }
        let frame_len = u16::from_be_bytes(length) as usize;
        let mut frame = vec![0u8; frame_len];
        if read_half.read_exact(&mut frame).await.is_err() {
            break;
        }
        trace!(server = %addr, len = frame_len, "TCP frame received");
        if dispatch_response(&servers, &requests, addr, &frame).await {
            // A protocol fault unloaded the server; the connection is
            // already torn down.
            return;
        }
    }

    debug!(server = %addr, "TCP connection closed");
    let reason = ResolveError::Resolution(format!("TCP connection to {addr} closed"));
    fail_pending(&entry, &requests, &reason);
    let mut slot = entry.tcp.lock().await;
    if let TcpSlot::Established(conn) = &*slot {
        conn.abort();
        *slot = TcpSlot::Idle;
    }
}
