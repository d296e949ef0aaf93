//! System resolver configuration: loader contract plus a minimal
//! `resolv.conf` reader for the default setup.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::constants::{DEFAULT_ATTEMPTS, DEFAULT_NAMESERVERS, DEFAULT_TIMEOUT};
use crate::error::{ResolveError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// Nameserver endpoints, `host` or `host:port` with IPv6 hosts bracketed.
    pub nameservers: Vec<String>,
    pub timeout: Duration,
    pub attempts: u8,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            nameservers: DEFAULT_NAMESERVERS.iter().map(|s| s.to_string()).collect(),
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}

#[async_trait]
pub trait SystemConfigLoader: Send + Sync {
    async fn load(&self) -> Result<SystemConfig>;
}

/// Reads `nameserver` and `options timeout:n attempts:n` directives from an
/// `/etc/resolv.conf`-style file.
pub struct ResolvConfLoader {
    path: PathBuf,
}

impl ResolvConfLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ResolvConfLoader {
    fn default() -> Self {
        Self::new("/etc/resolv.conf")
    }
}

#[async_trait]
impl SystemConfigLoader for ResolvConfLoader {
    async fn load(&self) -> Result<SystemConfig> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| {
                debug!(path = %self.path.display(), "resolv.conf unreadable: {err}");
                ResolveError::from(err)
            })?;
        Ok(parse_resolv_conf(&content))
    }
}

pub(crate) fn parse_resolv_conf(content: &str) -> SystemConfig {
    let mut config = SystemConfig {
        nameservers: Vec::new(),
        ..Default::default()
    };

    for line in content.lines() {
        let line = line
            .split(|c| c == '#' || c == ';')
            .next()
            .unwrap_or("")
            .trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => {
                let Some(host) = fields.next() else { continue };
                // Accept bare addresses and host:port endpoints, skip junk.
                if host.parse::<IpAddr>().is_ok() || host.parse::<SocketAddr>().is_ok() {
                    config.nameservers.push(host.to_string());
                }
            }
            Some("options") => {
                for option in fields {
                    if let Some(value) = option.strip_prefix("timeout:") {
                        if let Ok(seconds) = value.parse::<u64>() {
                            config.timeout = Duration::from_secs(seconds);
                        }
                    } else if let Some(value) = option.strip_prefix("attempts:") {
                        if let Ok(attempts) = value.parse::<u8>() {
                            config.attempts = attempts;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if config.nameservers.is_empty() {
        config.nameservers = SystemConfig::default().nameservers;
    }
    config
}
