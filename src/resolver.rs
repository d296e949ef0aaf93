//! The lookup pipeline: hosts data, cache, upstream walk and CNAME/DNAME
//! recursion, with coalescing of duplicate in-flight lookups.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OnceCell, broadcast};
use tracing::{debug, warn};

use crate::cache::{Cache, MemoryCache, cache_key, decode_answers, encode_answers};
use crate::codec::{Message, RCODE_NOERROR, RCODE_NXDOMAIN, RecordType};
use crate::constants::{DEFAULT_NAMESERVERS, DEFAULT_TIMEOUT, DNS_PORT, MAX_CNAME_HOPS, NEGATIVE_CACHE_TTL};
use crate::error::{ResolveError, Result};
use crate::hosts::{HostsFileLoader, HostsLoader, HostsStore};
use crate::name;
use crate::registry::{PROTO_ANY, PROTO_TCP, PROTO_UDP, ServerEntry, ServerRegistry};
use crate::request::RequestTable;
use crate::system_config::{ResolvConfLoader, SystemConfig, SystemConfigLoader};
use crate::transport;

/// One answer returned to the caller: canonical record data, the record type
/// and the TTL reported upstream (`None` for synthetic and hosts answers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub data: String,
    pub record_type: RecordType,
    pub ttl: Option<u32>,
}

/// External collaborators of the resolver core.
pub struct ResolverConfig {
    pub cache: Arc<dyn Cache>,
    pub system_config_loader: Arc<dyn SystemConfigLoader>,
    pub hosts_loader: Arc<dyn HostsLoader>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache: Arc::new(MemoryCache::new()),
            system_config_loader: Arc::new(ResolvConfLoader::default()),
            hosts_loader: Arc::new(HostsFileLoader::default()),
        }
    }
}

/// Options for [`Resolver::resolve`].
#[derive(Clone, Debug)]
pub struct ResolveOptions {
    /// Record types to look up, a subset of `{A, AAAA}`. Empty means both.
    pub types: Vec<RecordType>,
    /// Override upstream endpoint, `[udp://|tcp://]host[:port]`.
    pub server: Option<String>,
    pub timeout: Option<Duration>,
    /// Consult the static host table.
    pub hosts: bool,
    /// Consult and populate the answer cache.
    pub cache: bool,
    /// Force a hosts re-read before lookup.
    pub reload_hosts: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            types: vec![RecordType::A, RecordType::AAAA],
            server: None,
            timeout: None,
            hosts: true,
            cache: true,
            reload_hosts: false,
        }
    }
}

/// Options for [`Resolver::query`].
#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub server: Option<String>,
    pub timeout: Option<Duration>,
    pub cache: bool,
    /// Follow CNAME/DNAME chains.
    pub recurse: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            server: None,
            timeout: None,
            cache: true,
            recurse: false,
        }
    }
}

struct InFlight {
    tx: broadcast::Sender<Result<Vec<Answer>>>,
}

#[derive(Clone)]
struct Upstreams {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

struct ResolverInner {
    config: ResolverConfig,
    registry: Arc<ServerRegistry>,
    hosts: HostsStore,
    /// Coalescers for duplicate concurrent lookups, keyed by
    /// `name#type-set` (resolve) and `name#type` (query).
    lookups: DashMap<String, InFlight>,
    queries: DashMap<String, InFlight>,
    upstreams: OnceCell<Upstreams>,
}

/// Asynchronous DNS stub resolver.
///
/// Cloning is cheap; clones share sockets, cache, hosts data and in-flight
/// state.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

impl Resolver {
    pub async fn new() -> Result<Self> {
        Self::with_config(ResolverConfig::default()).await
    }

    pub async fn with_config(config: ResolverConfig) -> Result<Self> {
        let requests = Arc::new(RequestTable::new());
        let registry = ServerRegistry::bind(requests).await?;
        let hosts = HostsStore::new(config.hosts_loader.clone());
        Ok(Self {
            inner: Arc::new(ResolverInner {
                config,
                registry,
                hosts,
                lookups: DashMap::new(),
                queries: DashMap::new(),
                upstreams: OnceCell::new(),
            }),
        })
    }

    /// The cache this resolver reads and writes.
    pub fn cache(&self) -> Arc<dyn Cache> {
        self.inner.config.cache.clone()
    }

    /// Resolve `name` to addresses, consulting hosts data, the cache and the
    /// configured upstream servers in that order.
    pub async fn resolve(&self, name: &str, options: ResolveOptions) -> Result<Vec<Answer>> {
        // IP literals are answered synthetically, touching nothing.
        if let Ok(ip) = name.parse::<IpAddr>() {
            let record_type = match ip {
                IpAddr::V4(_) => RecordType::A,
                IpAddr::V6(_) => RecordType::AAAA,
            };
            return Ok(vec![Answer {
                data: name.to_string(),
                record_type,
                ttl: None,
            }]);
        }

        name::validate(name)?;
        let name = name.to_ascii_lowercase();

        let mut types = if options.types.is_empty() {
            vec![RecordType::A, RecordType::AAAA]
        } else {
            options.types.clone()
        };
        let mut seen = Vec::new();
        types.retain(|t| {
            if seen.contains(t) {
                false
            } else {
                seen.push(*t);
                true
            }
        });
        for rtype in &types {
            if !matches!(rtype, RecordType::A | RecordType::AAAA) {
                return Err(ResolveError::InvalidType(*rtype));
            }
        }

        let mut type_ids: Vec<u16> = types.iter().map(|t| u16::from(*t)).collect();
        type_ids.sort_unstable();
        let key = format!(
            "{name}#{}",
            type_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join("/")
        );

        self.coalesced(&self.inner.lookups, key, self.do_resolve(&name, &types, &options))
            .await
    }

    /// Low-level single-type lookup. With `recurse` set, CNAME/DNAME chains
    /// are followed up to 30 hops; recursion never applies when `rtype` is
    /// itself CNAME or DNAME.
    pub async fn query(
        &self,
        name: &str,
        rtype: RecordType,
        options: QueryOptions,
    ) -> Result<Vec<Answer>> {
        name::validate(name)?;
        let name = name.to_ascii_lowercase();
        let key = format!("{name}#{}", u16::from(rtype));

        self.coalesced(&self.inner.queries, key, self.do_query(&name, rtype, &options))
            .await
    }

    /// Share one in-flight lookup among duplicate concurrent callers. The
    /// leader runs `fut` and broadcasts; late joiners subscribe.
    async fn coalesced<F>(
        &self,
        map: &DashMap<String, InFlight>,
        key: String,
        fut: F,
    ) -> Result<Vec<Answer>>
    where
        F: Future<Output = Result<Vec<Answer>>>,
    {
        let tx = match map.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let mut rx = occupied.get().tx.subscribe();
                drop(occupied);
                debug!(key = %key, "joining in-flight lookup");
                return match rx.recv().await {
                    Ok(result) => result,
                    Err(_) => Err(ResolveError::Resolution(
                        "In-flight lookup was abandoned".to_string(),
                    )),
                };
            }
            Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(16);
                vacant.insert(InFlight { tx: tx.clone() });
                tx
            }
        };

        let guard = InFlightGuard { map, key: &key };
        let result = fut.await;
        // Settle before broadcasting so fresh callers start a new lookup
        // instead of subscribing to a channel that already fired.
        drop(guard);
        let _ = tx.send(result.clone());
        result
    }

    async fn do_resolve(
        &self,
        name: &str,
        types: &[RecordType],
        options: &ResolveOptions,
    ) -> Result<Vec<Answer>> {
        if options.hosts {
            self.inner.hosts.ensure_loaded(options.reload_hosts).await;
        }

        let mut buckets: Vec<(RecordType, Vec<Answer>)> = Vec::new();
        let mut pending: Vec<RecordType> = Vec::new();

        for rtype in types {
            if options.hosts {
                if let Some(address) = self.inner.hosts.lookup(name, *rtype) {
                    debug!(qname = name, rtype = ?rtype, "answered from hosts data");
                    merge_bucket(
                        &mut buckets,
                        *rtype,
                        vec![Answer {
                            data: address,
                            record_type: *rtype,
                            ttl: None,
                        }],
                    );
                    continue;
                }
            }
            if options.cache {
                if let Some(raw) = self.inner.config.cache.get(&cache_key(name, *rtype)).await {
                    if let Some(answers) = decode_answers(&raw) {
                        debug!(qname = name, rtype = ?rtype, hits = answers.len(), "cache hit");
                        merge_bucket(&mut buckets, *rtype, answers);
                        continue;
                    }
                    debug!(qname = name, rtype = ?rtype, "discarding unreadable cache entry");
                }
            }
            pending.push(*rtype);
        }

        if pending.is_empty() {
            if buckets.iter().any(|(_, answers)| !answers.is_empty()) {
                return Ok(flatten(types, &buckets));
            }
            return Err(ResolveError::NoRecords(format!(
                "No records returned for {name} (cached result)"
            )));
        }

        let (servers, timeout) = self
            .upstreams_for(options.server.as_deref(), options.timeout)
            .await?;

        match self
            .walk_upstreams(&servers, name, &pending, timeout, options.cache, None)
            .await
        {
            Ok(merged) => {
                for (rtype, answers) in merged {
                    merge_bucket(&mut buckets, rtype, answers);
                }
            }
            Err(err) => {
                // Partial answers already collected win over upstream errors.
                if buckets.iter().any(|(_, answers)| !answers.is_empty()) {
                    warn!(qname = name, error = %err, "all upstream servers failed, returning partial result");
                    return Ok(flatten(types, &buckets));
                }
                return Err(err);
            }
        }

        if buckets.iter().any(|(_, answers)| !answers.is_empty()) {
            Ok(flatten(types, &buckets))
        } else {
            Err(ResolveError::NoRecords(format!(
                "No records returned for {name}"
            )))
        }
    }

    async fn do_query(
        &self,
        name: &str,
        rtype: RecordType,
        options: &QueryOptions,
    ) -> Result<Vec<Answer>> {
        let (servers, timeout) = self
            .upstreams_for(options.server.as_deref(), options.timeout)
            .await?;

        let mut current = name.to_string();
        let mut hops = 0u32;

        loop {
            if options.cache {
                if let Some(raw) = self
                    .inner
                    .config
                    .cache
                    .get(&cache_key(&current, rtype))
                    .await
                {
                    if let Some(answers) = decode_answers(&raw) {
                        if answers.is_empty() {
                            return Err(ResolveError::NoRecords(format!(
                                "No records returned for {current} (cached result)"
                            )));
                        }
                        debug!(qname = %current, rtype = ?rtype, "cache hit");
                        return Ok(answers);
                    }
                }
            }

            let walked = self
                .walk_upstreams(&servers, &current, &[rtype], timeout, options.cache, None)
                .await;
            // A UDP timeout earns one whole-query retry over TCP; a second
            // timeout is fatal.
            let walked = match walked {
                Err(err) if err.is_timeout() => {
                    debug!(qname = %current, "query timed out, retrying over TCP");
                    self.walk_upstreams(
                        &servers,
                        &current,
                        &[rtype],
                        timeout,
                        options.cache,
                        Some(PROTO_TCP),
                    )
                    .await
                }
                other => other,
            };
            let buckets = walked?;

            if let Some((_, answers)) = buckets.iter().find(|(t, _)| *t == rtype) {
                if !answers.is_empty() {
                    return Ok(flatten(&[rtype], &buckets));
                }
            }

            if buckets.is_empty() {
                return Err(ResolveError::NoRecords(format!(
                    "No records returned for {current}"
                )));
            }

            if options.recurse && !matches!(rtype, RecordType::CNAME | RecordType::DNAME) {
                let target = buckets
                    .iter()
                    .find(|(t, _)| matches!(t, RecordType::CNAME | RecordType::DNAME))
                    .and_then(|(_, answers)| answers.first())
                    .map(|answer| answer.data.clone());
                if let Some(target) = target {
                    hops += 1;
                    if hops > MAX_CNAME_HOPS {
                        return Err(ResolveError::Resolution(
                            "CNAME or DNAME chain too long".to_string(),
                        ));
                    }
                    debug!(qname = %current, target = %target, hop = hops, "following alias chain");
                    current = target.to_ascii_lowercase();
                    continue;
                }
            }

            return Ok(flatten(&[rtype], &buckets));
        }
    }

    /// Walk the server list in order, issuing all `types` as one concurrent
    /// batch per server. The first server that answers every question (with
    /// records or with a proven absence) wins; per-server errors continue
    /// the walk.
    async fn walk_upstreams(
        &self,
        servers: &[(SocketAddr, u8)],
        name: &str,
        types: &[RecordType],
        timeout: Duration,
        use_cache: bool,
        mask_override: Option<u8>,
    ) -> Result<Vec<(RecordType, Vec<Answer>)>> {
        let mut last_error: Option<ResolveError> = None;
        let mut all_timeouts = true;

        for (addr, mask) in servers {
            let entry = match self.inner.registry.get_or_load(*addr, *mask) {
                Ok(entry) => entry,
                Err(err) => {
                    all_timeouts = false;
                    last_error = Some(err);
                    continue;
                }
            };
            let mask = mask_override.unwrap_or_else(|| entry.protocols());

            let queries = types
                .iter()
                .map(|rtype| self.query_upstream(&entry, mask, name, *rtype, timeout, use_cache));
            let outcomes = futures::future::join_all(queries).await;

            let mut merged: Vec<(RecordType, Vec<Answer>)> = Vec::new();
            let mut attempt_error = None;
            for outcome in outcomes {
                match outcome {
                    Ok(answer_buckets) => {
                        for (rtype, answers) in answer_buckets {
                            merge_bucket(&mut merged, rtype, answers);
                        }
                    }
                    // A proven absence is an answer, not a server fault.
                    Err(ResolveError::NoRecords(_)) => {}
                    Err(err) => {
                        attempt_error = Some(err);
                        break;
                    }
                }
            }

            match attempt_error {
                Some(err) => {
                    debug!(server = %addr, error = %err, "upstream attempt failed, trying next server");
                    if !err.is_timeout() {
                        all_timeouts = false;
                    }
                    last_error = Some(err);
                }
                None => return Ok(merged),
            }
        }

        Err(match last_error {
            Some(err) if all_timeouts => err,
            Some(_) => ResolveError::Resolution("All name resolution requests failed".to_string()),
            None => ResolveError::Resolution("No upstream servers configured".to_string()),
        })
    }

    async fn query_upstream(
        &self,
        entry: &Arc<ServerEntry>,
        mask: u8,
        name: &str,
        rtype: RecordType,
        timeout: Duration,
        use_cache: bool,
    ) -> Result<Vec<(RecordType, Vec<Answer>)>> {
        let message =
            transport::exchange(&self.inner.registry, entry, mask, name, rtype, timeout).await?;
        self.process_response(name, rtype, &message, use_cache).await
    }

    /// Bucket a response's answers per type and write them back to the
    /// cache. NXDOMAIN and empty responses become negative-cache entries;
    /// any other non-zero RCODE fails the request and caches nothing.
    async fn process_response(
        &self,
        name: &str,
        rtype: RecordType,
        message: &Message,
        use_cache: bool,
    ) -> Result<Vec<(RecordType, Vec<Answer>)>> {
        let rcode = message.header.rcode;
        if rcode != RCODE_NOERROR && rcode != RCODE_NXDOMAIN {
            return Err(ResolveError::Resolution(format!(
                "Server returned error code: {rcode}"
            )));
        }

        let mut buckets: Vec<(RecordType, Vec<Answer>)> = Vec::new();
        if rcode == RCODE_NOERROR {
            for record in &message.answers {
                let answer = Answer {
                    data: record.data(),
                    record_type: record.rtype,
                    ttl: Some(record.ttl),
                };
                merge_bucket(&mut buckets, record.rtype, vec![answer]);
            }
        }

        if buckets.is_empty() {
            debug!(qname = name, rtype = ?rtype, rcode, "no records in upstream response");
            if use_cache {
                self.inner
                    .config
                    .cache
                    .set(&cache_key(name, rtype), encode_answers(&[]), NEGATIVE_CACHE_TTL)
                    .await;
            }
            return Err(ResolveError::NoRecords(format!(
                "No records returned for {name}"
            )));
        }

        if use_cache {
            for (btype, answers) in &buckets {
                let min_ttl = answers
                    .iter()
                    .filter_map(|answer| answer.ttl)
                    .filter(|ttl| *ttl > 0)
                    .min();
                if let Some(ttl) = min_ttl {
                    self.inner
                        .config
                        .cache
                        .set(
                            &cache_key(name, *btype),
                            encode_answers(answers),
                            Duration::from_secs(ttl as u64),
                        )
                        .await;
                }
            }
        }

        Ok(buckets)
    }

    async fn upstreams_for(
        &self,
        server: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<(Vec<(SocketAddr, u8)>, Duration)> {
        if let Some(uri) = server {
            let (addr, mask) = parse_custom_server(uri)?;
            return Ok((vec![(addr, mask)], timeout.unwrap_or(DEFAULT_TIMEOUT)));
        }
        let upstreams = self.upstreams().await;
        Ok((
            upstreams
                .servers
                .iter()
                .map(|addr| (*addr, PROTO_ANY))
                .collect(),
            timeout.unwrap_or(upstreams.timeout),
        ))
    }

    /// The memoized system server list; the underlying config load is
    /// coalesced across concurrent callers.
    async fn upstreams(&self) -> Upstreams {
        self.inner
            .upstreams
            .get_or_init(|| async {
                let loaded = match self.inner.config.system_config_loader.load().await {
                    Ok(config) => config,
                    Err(err) => {
                        warn!("system config load failed, using defaults: {err}");
                        SystemConfig::default()
                    }
                };

                let mut servers = Vec::new();
                for raw in &loaded.nameservers {
                    register_nameserver(&self.inner.registry, &mut servers, raw);
                }
                if servers.is_empty() {
                    for raw in DEFAULT_NAMESERVERS {
                        register_nameserver(&self.inner.registry, &mut servers, raw);
                    }
                }

                debug!(count = servers.len(), "upstream server list loaded");
                Upstreams {
                    servers,
                    timeout: loaded.timeout,
                }
            })
            .await
            .clone()
    }
}

struct InFlightGuard<'a> {
    map: &'a DashMap<String, InFlight>,
    key: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(self.key);
    }
}

fn merge_bucket(
    buckets: &mut Vec<(RecordType, Vec<Answer>)>,
    rtype: RecordType,
    answers: Vec<Answer>,
) {
    match buckets.iter_mut().find(|(t, _)| *t == rtype) {
        Some((_, existing)) => existing.extend(answers),
        None => buckets.push((rtype, answers)),
    }
}

/// Flatten per-type buckets into one sequence: requested types in their
/// original order first, then any extra types the server volunteered.
fn flatten(order: &[RecordType], buckets: &[(RecordType, Vec<Answer>)]) -> Vec<Answer> {
    let mut out = Vec::new();
    for rtype in order {
        for (btype, answers) in buckets {
            if btype == rtype {
                out.extend_from_slice(answers);
            }
        }
    }
    for (btype, answers) in buckets {
        if !order.contains(btype) {
            out.extend_from_slice(answers);
        }
    }
    out
}

fn register_nameserver(
    registry: &Arc<ServerRegistry>,
    servers: &mut Vec<SocketAddr>,
    raw: &str,
) {
    let Some(addr) = parse_server_addr(raw) else {
        warn!(server = %raw, "ignoring unparseable nameserver");
        return;
    };
    // IPv6 nameservers are dropped here when no IPv6 socket was bound.
    match registry.get_or_load(addr, PROTO_ANY) {
        Ok(_) => servers.push(addr),
        Err(err) => debug!(server = %addr, "skipping nameserver: {err}"),
    }
}

fn parse_server_addr(raw: &str) -> Option<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, DNS_PORT));
    }
    None
}

/// Parse a custom server URI. The scheme restricts the transport: `udp://`
/// clears the TCP bit and `tcp://` clears the UDP bit; no scheme allows
/// both. Port defaults to 53.
fn parse_custom_server(uri: &str) -> Result<(SocketAddr, u8)> {
    let (mask, rest) = if let Some(rest) = uri.strip_prefix("udp://") {
        (PROTO_UDP, rest)
    } else if let Some(rest) = uri.strip_prefix("tcp://") {
        (PROTO_TCP, rest)
    } else {
        (PROTO_ANY, uri)
    };
    match parse_server_addr(rest) {
        Some(addr) => Ok((addr, mask)),
        None => Err(ResolveError::Resolution(format!("Invalid server {uri}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_custom_server_schemes() {
        let (addr, mask) = parse_custom_server("udp://1.2.3.4").unwrap();
        assert_eq!(addr, "1.2.3.4:53".parse().unwrap());
        assert_eq!(mask, PROTO_UDP);

        let (addr, mask) = parse_custom_server("tcp://1.2.3.4:5353").unwrap();
        assert_eq!(addr, "1.2.3.4:5353".parse().unwrap());
        assert_eq!(mask, PROTO_TCP);

        let (addr, mask) = parse_custom_server("9.9.9.9").unwrap();
        assert_eq!(addr, "9.9.9.9:53".parse().unwrap());
        assert_eq!(mask, PROTO_ANY);

        let (addr, _) = parse_custom_server("[2001:db8::1]:53").unwrap();
        assert!(addr.is_ipv6());
    }

    #[test]
    fn rejects_invalid_custom_servers() {
        for uri in ["", "dns.example.com", "udp://", "http://1.2.3.4"] {
            let err = parse_custom_server(uri).unwrap_err();
            assert!(matches!(err, ResolveError::Resolution(ref msg) if msg.contains("Invalid server")));
        }
    }

    #[test]
    fn flatten_preserves_requested_order_then_extras() {
        let a = |data: &str, rtype| Answer {
            data: data.to_string(),
            record_type: rtype,
            ttl: Some(60),
        };
        let buckets = vec![
            (RecordType::CNAME, vec![a("alias.example", RecordType::CNAME)]),
            (RecordType::AAAA, vec![a("::1", RecordType::AAAA)]),
            (RecordType::A, vec![a("1.2.3.4", RecordType::A)]),
        ];
        let flat = flatten(&[RecordType::A, RecordType::AAAA], &buckets);
        assert_eq!(flat[0].data, "1.2.3.4");
        assert_eq!(flat[1].data, "::1");
        assert_eq!(flat[2].data, "alias.example");
    }

    #[test]
    fn merge_bucket_appends_in_place() {
        let answer = Answer {
            data: "1.1.1.1".to_string(),
            record_type: RecordType::A,
            ttl: Some(1),
        };
        let mut buckets = Vec::new();
        merge_bucket(&mut buckets, RecordType::A, vec![answer.clone()]);
        merge_bucket(&mut buckets, RecordType::A, vec![answer.clone()]);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].1.len(), 2);
    }

    #[test]
    fn parses_server_addresses() {
        assert_eq!(
            parse_server_addr("8.8.8.8"),
            Some("8.8.8.8:53".parse().unwrap())
        );
        assert_eq!(
            parse_server_addr("8.8.8.8:5353"),
            Some("8.8.8.8:5353".parse().unwrap())
        );
        assert_eq!(parse_server_addr("::1"), Some("[::1]:53".parse().unwrap()));
        assert_eq!(parse_server_addr("not an address"), None);
    }
}
