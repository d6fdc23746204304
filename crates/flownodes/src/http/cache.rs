//! Response cache port for the HTTP executor and its in-process implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flowcore::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

pub const DEFAULT_TTL_SECONDS: u64 = 300;
pub const DEFAULT_MAX_ENTRIES: usize = 1000;
const MAX_TTL_SECONDS: u64 = 365 * 24 * 3600;

/// Storage for cached HTTP responses. A multi-process deployment can plug a
/// shared store in here without touching the executor.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// A live entry for `key`; expired entries read as absent.
    async fn get(&self, key: &str) -> Option<Value>;

    async fn put(&self, key: String, value: Value, ttl_seconds: u64);

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn clear(&self);
}

/// The request components a cache key is derived from.
pub struct CacheKeyParts<'a> {
    pub url: &'a str,
    pub method: &'a str,
    pub params: &'a BTreeMap<String, String>,
    pub headers: &'a BTreeMap<String, String>,
    pub body: Option<&'a Value>,
    pub inputs: &'a HashMap<String, Value>,
}

/// Stable SHA-256 over the request components. Maps are serialized with
/// sorted keys so insertion order never changes the key.
pub fn cache_key(parts: &CacheKeyParts<'_>) -> String {
    let inputs: BTreeMap<&String, &Value> = parts.inputs.iter().collect();
    let canonical = serde_json::json!({
        "url": parts.url,
        "method": parts.method,
        "params": parts.params,
        "headers": parts.headers,
        "body": parts.body,
        "inputs": inputs,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

struct CacheEntry {
    value: Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-memory cache with lazy expiry. Once it holds more than `max_entries`
/// entries the oldest fifth is dropped.
pub struct InMemoryResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl InMemoryResponseCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }
}

impl Default for InMemoryResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) if Utc::now() < entry.expires_at => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    async fn put(&self, key: String, value: Value, ttl_seconds: u64) {
        let now = Utc::now();
        let ttl = Duration::seconds(ttl_seconds.min(MAX_TTL_SECONDS) as i64);
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
            },
        );

        if entries.len() > self.max_entries {
            let evict = (entries.len() / 5).max(1);
            let mut by_age: Vec<(DateTime<Utc>, String)> = entries
                .iter()
                .map(|(k, e)| (e.created_at, k.clone()))
                .collect();
            by_age.sort();
            for (_, key) in by_age.into_iter().take(evict) {
                entries.remove(&key);
            }
            tracing::debug!("HTTP cache evicted {} entries", evict);
        }
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}
