//! Static host table: loader contract, hosts-file parser and the store that
//! owns modification-time-based reloads.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::RecordType;
use crate::error::Result;

/// Host-name to address maps, one per address family. Names are lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostsData {
    pub v4: HashMap<String, String>,
    pub v6: HashMap<String, String>,
}

impl HostsData {
    pub fn lookup(&self, name: &str, rtype: RecordType) -> Option<&str> {
        match rtype {
            RecordType::A => self.v4.get(name),
            RecordType::AAAA => self.v6.get(name),
            _ => None,
        }
        .map(String::as_str)
    }
}

#[async_trait]
pub trait HostsLoader: Send + Sync {
    async fn load(&self) -> Result<HostsData>;

    /// Modification timestamp of the backing source, when one exists.
    async fn modified(&self) -> Option<SystemTime> {
        None
    }
}

/// Loads `/etc/hosts`-format files. A missing file yields an empty table.
pub struct HostsFileLoader {
    path: PathBuf,
}

impl HostsFileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn system_default() -> Self {
        #[cfg(windows)]
        let path = r"C:\Windows\System32\drivers\etc\hosts";
        #[cfg(not(windows))]
        let path = "/etc/hosts";
        Self::new(path)
    }
}

impl Default for HostsFileLoader {
    fn default() -> Self {
        Self::system_default()
    }
}

#[async_trait]
impl HostsLoader for HostsFileLoader {
    async fn load(&self) -> Result<HostsData> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) => {
                debug!(path = %self.path.display(), "hosts file unreadable: {err}");
                return Ok(HostsData::default());
            }
        };
        Ok(parse_hosts(&content))
    }

    async fn modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path).await.ok()?.modified().ok()
    }
}

pub(crate) fn parse_hosts(content: &str) -> HostsData {
    let mut data = HostsData::default();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(addr) = fields.next() else { continue };
        let Ok(ip) = addr.parse::<IpAddr>() else {
            continue;
        };
        for name in fields {
            let key = name.to_ascii_lowercase();
            match ip {
                IpAddr::V4(v4) => {
                    data.v4.entry(key).or_insert_with(|| v4.to_string());
                }
                IpAddr::V6(v6) => {
                    data.v6.entry(key).or_insert_with(|| v6.to_string());
                }
            }
        }
    }
    data
}

#[cfg(windows)]
fn inject_localhost(data: &mut HostsData) {
    use std::net::{Ipv4Addr, Ipv6Addr};

    // Windows resolves localhost internally and omits it from the hosts file.
    if !data.v4.contains_key("localhost") && !data.v6.contains_key("localhost") {
        data.v4
            .insert("localhost".to_string(), Ipv4Addr::LOCALHOST.to_string());
        data.v6
            .insert("localhost".to_string(), Ipv6Addr::LOCALHOST.to_string());
    }
}

#[cfg(not(windows))]
fn inject_localhost(_data: &mut HostsData) {}

struct HostsState {
    data: Arc<HostsData>,
    loaded: bool,
    modified: Option<SystemTime>,
}

/// Holds the current host table and refreshes it when the source's
/// modification timestamp advances or a caller forces a reload.
pub struct HostsStore {
    loader: Arc<dyn HostsLoader>,
    state: Mutex<HostsState>,
}

impl HostsStore {
    pub fn new(loader: Arc<dyn HostsLoader>) -> Self {
        Self {
            loader,
            state: Mutex::new(HostsState {
                data: Arc::new(HostsData::default()),
                loaded: false,
                modified: None,
            }),
        }
    }

    pub async fn ensure_loaded(&self, force: bool) {
        let (loaded, last_modified) = {
            let state = self.state.lock();
            (state.loaded, state.modified)
        };
        let source_modified = self.loader.modified().await;
        let stale = match (last_modified, source_modified) {
            (Some(last), Some(current)) => current > last,
            (None, Some(_)) => !loaded,
            _ => false,
        };
        if loaded && !force && !stale {
            return;
        }

        match self.loader.load().await {
            Ok(mut data) => {
                inject_localhost(&mut data);
                debug!(
                    v4 = data.v4.len(),
                    v6 = data.v6.len(),
                    "hosts data loaded"
                );
                let mut state = self.state.lock();
                state.data = Arc::new(data);
                state.loaded = true;
                state.modified = source_modified;
            }
            Err(err) => {
                warn!("failed to load hosts data: {err}");
                self.state.lock().loaded = true;
            }
        }
    }

    pub fn lookup(&self, name: &str, rtype: RecordType) -> Option<String> {
        self.state
            .lock()
            .data
            .lookup(name, rtype)
            .map(str::to_string)
    }
}
