use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResolveError>;

use crate::codec::RecordType;

/// Unified error type surfaced by the resolver.
///
/// Per-server failures during an upstream walk are swallowed internally; what
/// reaches the caller is the aggregate outcome described by each variant.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The supplied host name failed validation.
    #[error("Invalid host name: {0}")]
    InvalidName(String),

    /// `resolve` was asked for a record type other than A/AAAA.
    #[error("Invalid record type for resolve: {0:?}")]
    InvalidType(RecordType),

    /// The upstream (or the cache) answered, but held no records of any
    /// requested type.
    #[error("{0}")]
    NoRecords(String),

    /// The request exceeded its timeout budget on every tried transport and
    /// server.
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// Catch-all for upstream failures: non-zero response codes, truncated
    /// TCP responses, malformed packets, socket failures, invalid custom
    /// server URIs, connect failures and exceeded recursion depth.
    #[error("{0}")]
    Resolution(String),

    /// Local socket creation failed.
    #[error("Socket error: {0}")]
    Socket(Arc<std::io::Error>),
}

impl From<std::io::Error> for ResolveError {
    fn from(err: std::io::Error) -> Self {
        ResolveError::Socket(Arc::new(err))
    }
}

impl ResolveError {
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, ResolveError::Timeout(_))
    }
}
