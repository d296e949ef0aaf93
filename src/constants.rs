use std::time::Duration;

pub const DNS_PORT: u16 = 53;

/// Largest inbound UDP datagram accepted from an upstream server.
pub const MAX_UDP_PACKET_SIZE: usize = 1024;

/// Request IDs wrap at this bound (the full 16-bit space).
pub const MAX_REQUEST_ID: u32 = 65_536;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_ATTEMPTS: u8 = 2;
pub const DEFAULT_NAMESERVERS: [&str; 2] = ["8.8.8.8:53", "8.8.4.4:53"];

/// TTL for negative cache entries (RFC 2308 section 7.1).
pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(300);

/// CNAME/DNAME chains longer than this fail the query.
pub const MAX_CNAME_HOPS: u32 = 30;

pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A server whose pending-request set stays empty this long is unloaded.
pub const SERVER_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub const MAX_NAME_LENGTH: usize = 253;
pub const MAX_LABEL_LENGTH: usize = 63;

/// Bound on compression-pointer jumps while decoding a single name.
pub const MAX_COMPRESSION_JUMPS: usize = 5;
