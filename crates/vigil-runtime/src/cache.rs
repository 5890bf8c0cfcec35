use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde_json::Value;

/// In-process TTL key/value cache for short-lived engine state: per-rule
/// evaluation snapshots and open grouping windows.
///
/// Loss is tolerated by design. The alerts and rules tables remain the
/// durable source of truth and the engine re-warms from them.
pub struct StateCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    created_at: Instant,
}

impl StateCache {
    /// Create a cache with default capacity.
    pub fn new() -> Self {
        Self::with_max_entries(10_000)
    }

    /// Create a cache with a maximum number of entries.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    /// Get a cached value if it exists and hasn't expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;

        if Instant::now() < entry.expires_at {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Set a value with a TTL.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            expires_at: now + ttl,
            created_at: now,
        };

        if let Ok(mut entries) = self.entries.write() {
            if entries.len() >= self.max_entries {
                self.evict_expired(&mut entries);
            }
            if entries.len() >= self.max_entries {
                self.evict_oldest(&mut entries, self.max_entries / 10);
            }

            entries.insert(key.into(), entry);
        }
    }

    /// Remove a key.
    pub fn invalidate(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    /// Remove every key under a prefix (e.g. all state for one rule).
    pub fn invalidate_prefix(&self, prefix: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|k, _| !k.starts_with(prefix));
        }
    }

    /// Clear the entire cache.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(&self, entries: &mut HashMap<String, CacheEntry>) {
        let now = Instant::now();
        entries.retain(|_, v| v.expires_at > now);
    }

    fn evict_oldest(&self, entries: &mut HashMap<String, CacheEntry>, count: usize) {
        let mut oldest: Vec<_> = entries
            .iter()
            .map(|(k, v)| (k.clone(), v.created_at))
            .collect();

        oldest.sort_by_key(|(_, t)| *t);

        for (key, _) in oldest.into_iter().take(count) {
            entries.remove(&key);
        }
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache key for a rule's evaluation snapshot.
pub fn eval_state_key(rule_id: uuid::Uuid) -> String {
    format!("eval:{}", rule_id)
}

/// Cache key for an open grouping window.
pub fn group_window_key(source: &str, severity: &str) -> String {
    format!("group:{}:{}", source, severity)
}
