//! In-memory TTL cache for successful read responses.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// Shared response cache keyed by [`cache_key`].
///
/// Entries live for a fixed TTL. There is no size-based eviction: key
/// cardinality is bounded by endpoint × parameter set.
#[derive(Debug, Clone)]
pub struct RequestCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl RequestCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_disabled(&self) -> bool {
        self.ttl.is_zero()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a fresh entry. An expired entry is evicted on the way out.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => {
                tracing::debug!(
                    "Cache hit: {} (age: {:.1}s)",
                    key,
                    now.saturating_duration_since(entry.stored_at).as_secs_f64()
                );
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                tracing::debug!("Cache entry expired: {}", key);
                None
            }
            None => None,
        }
    }

    pub async fn set(&self, key: String, value: Value) {
        if self.is_disabled() {
            return;
        }

        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl: self.ttl,
        };
        self.entries.lock().await.insert(key, entry);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
        tracing::info!("Cache cleared");
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        before - entries.len()
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Build a cache key from a URL and its query parameters.
///
/// Parameters are sorted by name, so ordering at the call site does not
/// matter.
pub fn cache_key(url: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }

    let mut sorted: Vec<_> = params.to_vec();
    sorted.sort();

    let query = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", url, query)
}
