//! Transport selection for upstream exchanges.
//!
//! Chooses UDP-first, TCP-first or a fallback sequence from the server's
//! allowed-protocol mask and current TCP state, and retries truncated UDP
//! responses over TCP at the same server.

pub(crate) mod tcp;
pub(crate) mod udp;

pub use udp::UdpMultiplexer;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::codec::{Message, RecordType};
use crate::error::{ResolveError, Result};
use crate::registry::{PROTO_TCP, PROTO_UDP, ServerEntry, ServerRegistry};

/// Perform one question/answer exchange with `entry`, honoring the
/// allowed-protocol mask.
pub(crate) async fn exchange(
    registry: &Arc<ServerRegistry>,
    entry: &Arc<ServerEntry>,
    mask: u8,
    name: &str,
    rtype: RecordType,
    timeout: Duration,
) -> Result<Message> {
    let udp_allowed = mask & PROTO_UDP != 0;
    let tcp_allowed = mask & PROTO_TCP != 0 && !entry.tcp_failed();

    match (udp_allowed, tcp_allowed) {
        (false, false) => Err(ResolveError::Resolution(format!(
            "No usable transport for server {}",
            entry.addr()
        ))),
        (true, false) => udp_flow(registry, entry, name, rtype, timeout, false).await,
        (false, true) => tcp_flow(registry, entry, name, rtype, timeout).await,
        (true, true) => {
            if entry.tcp_established_now() {
                match tcp_flow(registry, entry, name, rtype, timeout).await {
                    Ok(message) => Ok(message),
                    // No fallback once a protocol fault unloaded the server.
                    Err(err) if !registry.is_loaded(entry.addr()) => Err(err),
                    Err(err) => {
                        debug!(server = %entry.addr(), error = %err, "TCP exchange failed, falling back to UDP");
                        udp_flow(registry, entry, name, rtype, timeout, false).await
                    }
                }
            } else {
                match udp_flow(registry, entry, name, rtype, timeout, true).await {
                    Ok(message) => {
                        dial_in_background(registry, entry);
                        Ok(message)
                    }
                    Err(err) if !registry.is_loaded(entry.addr()) => Err(err),
                    Err(err) => {
                        debug!(server = %entry.addr(), error = %err, "UDP exchange failed, falling back to TCP");
                        tcp_flow(registry, entry, name, rtype, timeout).await
                    }
                }
            }
        }
    }
}

/// UDP exchange with truncation handling: a TC response is retransmitted
/// over TCP when the mask allows it and fails the request otherwise.
async fn udp_flow(
    registry: &Arc<ServerRegistry>,
    entry: &Arc<ServerEntry>,
    name: &str,
    rtype: RecordType,
    timeout: Duration,
    tcp_on_truncation: bool,
) -> Result<Message> {
    let message = udp_exchange(registry, entry, name, rtype, timeout).await?;
    if !message.header.tc {
        return Ok(message);
    }
    if tcp_on_truncation {
        debug!(server = %entry.addr(), qname = name, "truncated UDP response, retrying over TCP");
        return tcp_flow(registry, entry, name, rtype, timeout).await;
    }
    Err(ResolveError::Resolution(
        "Server returned truncated response".to_string(),
    ))
}

/// TCP exchange; a truncated response over TCP is a hard failure.
async fn tcp_flow(
    registry: &Arc<ServerRegistry>,
    entry: &Arc<ServerEntry>,
    name: &str,
    rtype: RecordType,
    timeout: Duration,
) -> Result<Message> {
    let message = tcp_exchange(registry, entry, name, rtype, timeout).await?;
    if message.header.tc {
        return Err(ResolveError::Resolution(
            "Server returned truncated response".to_string(),
        ));
    }
    Ok(message)
}

/// After a UDP success, open the TCP connection in the background so later
/// requests can use it.
fn dial_in_background(registry: &Arc<ServerRegistry>, entry: &Arc<ServerEntry>) {
    if entry.tcp_failed() || !entry.tcp_idle_now() {
        return;
    }
    let servers = registry.servers_arc();
    let requests = registry.requests_arc();
    let entry = entry.clone();
    tokio::spawn(async move {
        if let Err(err) = tcp::ensure_conn(&servers, &requests, &entry).await {
            debug!(server = %entry.addr(), "background TCP dial failed: {err}");
        }
    });
}

async fn udp_exchange(
    registry: &Arc<ServerRegistry>,
    entry: &Arc<ServerEntry>,
    name: &str,
    rtype: RecordType,
    timeout: Duration,
) -> Result<Message> {
    let (id, rx) = registry.requests().insert(name, rtype, entry.addr());
    entry.add_pending(id);

    let data = match Message::query(id, name, rtype).encode() {
        Ok(data) => data,
        Err(err) => {
            abandon(registry, entry, id);
            return Err(ResolveError::Resolution(format!(
                "Failed to encode query: {err}"
            )));
        }
    };

    // Held for the whole exchange when this is the server's first contact.
    let _permit = entry.udp_gate().await;

    trace!(server = %entry.addr(), id, qname = name, rtype = ?rtype, "sending UDP query");
    if let Err(err) = registry.udp().send(entry.addr(), Bytes::from(data)) {
        abandon(registry, entry, id);
        return Err(err);
    }

    await_response(registry, entry, id, rx, timeout).await
}

async fn tcp_exchange(
    registry: &Arc<ServerRegistry>,
    entry: &Arc<ServerEntry>,
    name: &str,
    rtype: RecordType,
    timeout: Duration,
) -> Result<Message> {
    let tx = tcp::ensure_conn(&registry.servers_arc(), &registry.requests_arc(), entry).await?;

    let (id, rx) = registry.requests().insert(name, rtype, entry.addr());
    entry.add_pending(id);

    let data = match Message::query(id, name, rtype).encode() {
        Ok(data) if data.len() <= u16::MAX as usize => data,
        Ok(_) => {
            abandon(registry, entry, id);
            return Err(ResolveError::Resolution(
                "Query too large for TCP framing".to_string(),
            ));
        }
        Err(err) => {
            abandon(registry, entry, id);
            return Err(ResolveError::Resolution(format!(
                "Failed to encode query: {err}"
            )));
        }
    };

    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(&data);

    trace!(server = %entry.addr(), id, qname = name, rtype = ?rtype, "sending TCP query");
    if tx.send(Bytes::from(frame)).is_err() {
        abandon(registry, entry, id);
        return Err(ResolveError::Resolution(format!(
            "TCP connection to {} closed",
            entry.addr()
        )));
    }

    await_response(registry, entry, id, rx, timeout).await
}

async fn await_response(
    registry: &Arc<ServerRegistry>,
    entry: &Arc<ServerEntry>,
    id: u16,
    rx: oneshot::Receiver<Result<Message>>,
    timeout: Duration,
) -> Result<Message> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ResolveError::Resolution(format!(
            "Request {id} was dropped"
        ))),
        Err(_) => {
            abandon(registry, entry, id);
            Err(ResolveError::Timeout(timeout.as_millis() as u64))
        }
    }
}

/// Forget a request that will never complete; late responses with its ID are
/// then discarded by the dispatcher.
fn abandon(registry: &Arc<ServerRegistry>, entry: &Arc<ServerEntry>, id: u16) {
    registry.requests().take(id);
    entry.remove_pending(id);
}
