use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Result;

// ---------------------------------------------------------------------------
// Storage abstraction
// ---------------------------------------------------------------------------

/// Backing store for room records, chat backlogs, and rate-limit counters.
///
/// Records are versioned: every successful write bumps an integer version,
/// and `compare_and_swap` only lands when the caller still holds the current
/// one.  The optimistic retry policy lives above this trait (see
/// `session::SessionStore`), so it can be exercised against [`MemoryStore`]
/// without a running backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a record and its current version.
    async fn fetch(&self, key: &str) -> Result<Option<(String, u64)>>;

    /// Create a record only if the key is absent. Returns `false` when the
    /// key already exists.
    async fn insert(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Replace a record only if its version still equals `expected`.
    /// Returns `false` on a version mismatch or a missing key.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Append to a bounded list, discarding the oldest entries beyond `cap`.
    async fn append_log(&self, key: &str, entry: &str, cap: usize, ttl: Duration) -> Result<()>;

    /// All retained list entries, oldest first.
    async fn log_entries(&self, key: &str) -> Result<Vec<String>>;

    /// Increment a counter that expires `window` after its first increment.
    /// Returns the post-increment count.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct Record {
    value: String,
    version: u64,
    expires_at: Instant,
}

struct LogEntrySet {
    entries: Vec<String>,
    expires_at: Instant,
}

struct Counter {
    count: u64,
    expires_at: Instant,
}

/// Process-local [`Store`] used by the test suite and single-node setups
/// without a Redis backend.  Semantics mirror the Redis implementation:
/// versions start at 1, TTLs are honoured lazily on access.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
    logs: Mutex<HashMap<String, LogEntrySet>>,
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch(&self, key: &str) -> Result<Option<(String, u64)>> {
        let mut records = self.records.lock().unwrap();
        match records.get(key) {
            Some(record) if record.expires_at > Instant::now() => {
                Ok(Some((record.value.clone(), record.version)))
            }
            Some(_) => {
                records.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn insert(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        let live = records
            .get(key)
            .map(|r| r.expires_at > Instant::now())
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                version: 1,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(key) {
            Some(record) if record.expires_at > Instant::now() && record.version == expected => {
                record.value = value.to_string();
                record.version += 1;
                record.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.lock().unwrap().remove(key);
        Ok(())
    }

    async fn append_log(&self, key: &str, entry: &str, cap: usize, ttl: Duration) -> Result<()> {
        let mut logs = self.logs.lock().unwrap();
        let set = logs.entry(key.to_string()).or_insert_with(|| LogEntrySet {
            entries: Vec::new(),
            expires_at: Instant::now() + ttl,
        });
        if set.expires_at <= Instant::now() {
            set.entries.clear();
        }
        set.expires_at = Instant::now() + ttl;
        set.entries.push(entry.to_string());
        if set.entries.len() > cap {
            let excess = set.entries.len() - cap;
            set.entries.drain(..excess);
        }
        Ok(())
    }

    async fn log_entries(&self, key: &str) -> Result<Vec<String>> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .get(key)
            .filter(|set| set.expires_at > Instant::now())
            .map(|set| set.entries.clone())
            .unwrap_or_default())
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64> {
        let mut counters = self.counters.lock().unwrap();
        let now = Instant::now();
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + window,
        });
        if counter.expires_at <= now {
            counter.count = 0;
            counter.expires_at = now + window;
        }
        counter.count += 1;
        Ok(counter.count)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn insert_is_create_only() {
        let store = MemoryStore::new();
        assert!(store.insert("k", "a", TTL).await.unwrap());
        assert!(!store.insert("k", "b", TTL).await.unwrap());

        let (value, version) = store.fetch("k").await.unwrap().unwrap();
        assert_eq!(value, "a");
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn cas_succeeds_only_on_current_version() {
        let store = MemoryStore::new();
        store.insert("k", "a", TTL).await.unwrap();

        assert!(store.compare_and_swap("k", 1, "b", TTL).await.unwrap());
        // Stale version: the first CAS bumped it to 2.
        assert!(!store.compare_and_swap("k", 1, "c", TTL).await.unwrap());

        let (value, version) = store.fetch("k").await.unwrap().unwrap();
        assert_eq!(value, "b");
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn cas_on_missing_key_fails() {
        let store = MemoryStore::new();
        assert!(!store.compare_and_swap("nope", 1, "v", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn expired_record_reads_as_absent() {
        let store = MemoryStore::new();
        store.insert("k", "a", Duration::ZERO).await.unwrap();
        assert!(store.fetch("k").await.unwrap().is_none());
        // And the key is free for re-creation.
        assert!(store.insert("k", "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn log_is_bounded_and_ordered() {
        let store = MemoryStore::new();
        for i in 0..6 {
            store.append_log("log", &format!("m{i}"), 4, TTL).await.unwrap();
        }

        let entries = store.log_entries("log").await.unwrap();
        assert_eq!(entries, vec!["m2", "m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn counter_increments_within_window() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_window("c", TTL).await.unwrap(), 1);
        assert_eq!(store.incr_window("c", TTL).await.unwrap(), 2);
    }
}
