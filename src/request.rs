//! In-flight request bookkeeping: 16-bit ID allocation and completion
//! dispatch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::codec::{Message, RecordType};
use crate::constants::MAX_REQUEST_ID;
use crate::error::Result;

pub(crate) struct PendingRequest {
    pub tx: oneshot::Sender<Result<Message>>,
    pub name: String,
    pub rtype: RecordType,
    pub server: SocketAddr,
}

/// Tracks every question awaiting an upstream answer, across all servers.
///
/// IDs advance monotonically through the 16-bit space, skipping any value
/// still in use, so an ID is unique until its request completes or fails.
pub struct RequestTable {
    pending: DashMap<u16, PendingRequest>,
    next_id: AtomicU32,
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU32::new(rand::random::<u16>() as u32),
        }
    }

    #[cfg(test)]
    fn with_start(start: u32) -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU32::new(start),
        }
    }

    pub(crate) fn insert(
        &self,
        name: &str,
        rtype: RecordType,
        server: SocketAddr,
    ) -> (u16, oneshot::Receiver<Result<Message>>) {
        loop {
            let id = (self.next_id.fetch_add(1, Ordering::Relaxed) % MAX_REQUEST_ID) as u16;
            match self.pending.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    let (tx, rx) = oneshot::channel();
                    vacant.insert(PendingRequest {
                        tx,
                        name: name.to_string(),
                        rtype,
                        server,
                    });
                    return (id, rx);
                }
            }
        }
    }

    pub(crate) fn take(&self, id: u16) -> Option<PendingRequest> {
        self.pending.remove(&id).map(|(_, pending)| pending)
    }

    pub(crate) fn server_of(&self, id: u16) -> Option<SocketAddr> {
        self.pending.get(&id).map(|pending| pending.server)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}
