//! Answer-cache contract and the default in-memory backend.
//!
//! The resolver treats the cache as an opaque asynchronous key/value store;
//! values are the JSON-serialized answer sequence for one `name#type` key.
//! A negative entry is an ordinary value holding an empty sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::codec::RecordType;
use crate::resolver::Answer;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
}

/// Cache key for one (name, record type) pair. `name` must be lowercased by
/// the caller.
pub fn cache_key(name: &str, rtype: RecordType) -> String {
    format!("{}#{}", name, u16::from(rtype))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAnswer {
    data: String,
    #[serde(rename = "type")]
    rtype: u16,
    ttl: Option<u32>,
}

pub(crate) fn encode_answers(answers: &[Answer]) -> String {
    let rows: Vec<CachedAnswer> = answers
        .iter()
        .map(|answer| CachedAnswer {
            data: answer.data.clone(),
            rtype: u16::from(answer.record_type),
            ttl: answer.ttl,
        })
        .collect();
    serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn decode_answers(raw: &str) -> Option<Vec<Answer>> {
    let rows: Vec<CachedAnswer> = serde_json::from_str(raw).ok()?;
    Some(
        rows.into_iter()
            .map(|row| Answer {
                data: row.data,
                record_type: RecordType::from(row.rtype),
                ttl: row.ttl,
            })
            .collect(),
    )
}

struct CacheSlot {
    value: String,
    expires_at: Instant,
}

/// TTL-bounded in-process cache. Expired entries are dropped on read and
/// swept opportunistically every few hundred writes.
pub struct MemoryCache {
    entries: DashMap<String, CacheSlot>,
    writes: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, slot| slot.expires_at > now);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(slot) if Instant::now() < slot.expires_at => return Some(slot.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        trace!(key, ttl_secs = ttl.as_secs(), "cache store");
        self.entries.insert(
            key.to_string(),
            CacheSlot {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        if self.writes.fetch_add(1, Ordering::Relaxed) % 256 == 255 {
            self.remove_expired();
        }
    }
}
