//! Context-aware response cache.
//!
//! Results are keyed by a content hash over the question, request kind,
//! attachment fingerprints and a fingerprint of the recent conversation —
//! the same question inside a different conversation is a different entry.
//!
//! Storage is pluggable behind [`ResponseCache`]: the in-memory store is the
//! default, a Redis-backed store (feature `shared-cache`) swaps only the
//! storage, never the key derivation.

use crate::context::ContextMessage;
use crate::{RequestKind, ResultSet};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};
#[cfg(feature = "shared-cache")]
use tracing::warn;

/// How many trailing conversation messages feed the context fingerprint.
const FINGERPRINT_MESSAGES: usize = 5;

/// Fraction denominator for capacity eviction: oldest `1/10 + 1` entries go.
const EVICTION_DIVISOR: usize = 10;

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        },
    )
}

/// Content-addressed cache key.
///
/// Derived once per dispatch from the full request identity; two requests
/// with the same key are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from the request identity.
    pub fn new(
        question: &str,
        kind: RequestKind,
        file_fingerprint: Option<&str>,
        image_fingerprint: Option<&str>,
        context_fingerprint: Option<&str>,
    ) -> Self {
        let composite = [
            question,
            kind.as_str(),
            file_fingerprint.unwrap_or(""),
            image_fingerprint.unwrap_or(""),
            context_fingerprint.unwrap_or(""),
        ]
        .join("|");

        let mut hasher = Sha256::new();
        hasher.update(composite.as_bytes());
        Self(hex(&hasher.finalize()))
    }

    /// The key as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Fingerprint of the last few conversation messages.
///
/// `None` for an empty context, so context-free requests share entries.
pub fn context_fingerprint(messages: &[ContextMessage]) -> Option<String> {
    if messages.is_empty() {
        return None;
    }
    let tail = &messages[messages.len().saturating_sub(FINGERPRINT_MESSAGES)..];
    let mut hasher = Sha256::new();
    for msg in tail {
        hasher.update(msg.role.as_bytes());
        hasher.update(b"|");
        hasher.update(msg.content.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hex(&hasher.finalize());
    Some(digest[..12].to_string())
}

/// Cache statistics for the status endpoint.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Entries currently held.
    pub entries: usize,
    /// Storage backend name (`"memory"` or `"redis"`).
    pub backend: &'static str,
}

/// Storage interface for cached [`ResultSet`]s.
///
/// Implementations must be safe for concurrent `get`/`set` from every
/// dispatcher invocation.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Fetch a live entry; expired entries are treated as absent.
    async fn get(&self, key: &CacheKey) -> Option<ResultSet>;

    /// Store an entry under `key`.
    async fn set(&self, key: &CacheKey, value: ResultSet);

    /// Current statistics.
    fn stats(&self) -> CacheStats;
}

struct MemoryEntry {
    value: ResultSet,
    stored_at: Instant,
}

/// In-process TTL cache with oldest-first capacity eviction.
pub struct MemoryCache {
    store: DashMap<String, MemoryEntry>,
    max_entries: usize,
    ttl: Duration,
}

impl MemoryCache {
    /// Create a cache holding up to `max_entries` entries for `ttl` each.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            store: DashMap::new(),
            max_entries,
            ttl,
        }
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        let removed = before - self.store.len();
        if removed > 0 {
            info!(removed, remaining = self.store.len(), "cache expiry sweep");
        }
        removed
    }

    /// Spawn the periodic expiry sweep. Abort the handle on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                cache.sweep_expired();
            }
        })
    }

    fn evict_oldest(&self) {
        // Collect outside the shard guards, then remove.
        let mut entries: Vec<(String, Instant)> = self
            .store
            .iter()
            .map(|e| (e.key().clone(), e.value().stored_at))
            .collect();
        entries.sort_by_key(|(_, stored_at)| *stored_at);

        let evict = entries.len() / EVICTION_DIVISOR + 1;
        for (key, _) in entries.into_iter().take(evict) {
            self.store.remove(&key);
        }
        debug!(evicted = evict, "cache capacity eviction");
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Option<ResultSet> {
        if let Some(entry) = self.store.get(key.as_str()) {
            if entry.stored_at.elapsed() < self.ttl {
                debug!(key = key.as_str(), "cache hit");
                return Some(entry.value.clone());
            }
            drop(entry);
            self.store.remove(key.as_str());
            debug!(key = key.as_str(), "cache entry expired");
        }
        debug!(key = key.as_str(), "cache miss");
        None
    }

    async fn set(&self, key: &CacheKey, value: ResultSet) {
        if self.max_entries > 0 && self.store.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.store.insert(
            key.as_str().to_string(),
            MemoryEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.store.len(),
            backend: "memory",
        }
    }
}

/// Redis-backed cache for horizontal scaling.
///
/// Same interface and key derivation as [`MemoryCache`]; Redis manages TTL
/// itself, so there is no sweep task. Storage errors degrade to cache misses
/// rather than failing the dispatch.
#[cfg(feature = "shared-cache")]
pub struct RedisCache {
    client: redis::Client,
    ttl: Duration,
}

#[cfg(feature = "shared-cache")]
impl RedisCache {
    /// Connect to Redis and verify the connection with a `PING`.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`redis::RedisError`] when the URL is invalid
    /// or the server is unreachable.
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        info!("redis cache connected");
        Ok(Self { client, ttl })
    }

    fn redis_key(key: &CacheKey) -> String {
        format!("dispatch:cache:{}", key.as_str())
    }
}

#[cfg(feature = "shared-cache")]
#[async_trait]
impl ResponseCache for RedisCache {
    async fn get(&self, key: &CacheKey) -> Option<ResultSet> {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "redis connection failed, treating as miss");
                return None;
            }
        };
        let raw: Option<String> = match redis::cmd("GET")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "redis get failed, treating as miss");
                return None;
            }
        };
        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key = key.as_str(), "cache hit (redis)");
                Some(value)
            }
            Err(e) => {
                warn!(error = %e, "corrupt redis cache entry dropped");
                None
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: ResultSet) {
        let payload = match serde_json::to_string(&value) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "cache value not serializable, skipping");
                return;
            }
        };
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "redis connection failed, skipping set");
                return;
            }
        };
        if let Err(e) = redis::cmd("SETEX")
            .arg(Self::redis_key(key))
            .arg(self.ttl.as_secs())
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
        {
            warn!(error = %e, "redis set failed");
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: 0, // would need a DBSIZE round-trip
            backend: "redis",
        }
    }
}
