//! Asynchronous DNS stub resolver.
//!
//! Lookups consult a static host table, a TTL-bounded answer cache and the
//! configured recursive upstream servers over UDP with TCP fallback, sharing
//! a small pool of sockets across all in-flight questions.

pub mod cache;
pub mod codec;
pub mod constants;
pub mod error;
pub mod hosts;
pub mod name;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod system_config;
pub mod transport;

pub use cache::{Cache, MemoryCache, cache_key};
pub use codec::{Message, RecordType};
pub use error::{ResolveError, Result};
pub use hosts::{HostsData, HostsFileLoader, HostsLoader};
pub use resolver::{Answer, QueryOptions, ResolveOptions, Resolver, ResolverConfig};
pub use system_config::{ResolvConfLoader, SystemConfig, SystemConfigLoader};
