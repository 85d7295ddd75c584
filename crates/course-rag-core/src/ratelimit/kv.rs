//! [`CounterStore`] over an eventually consistent key-value backend.
//!
//! Edge key-value services typically offer `get` and `put`-with-TTL but no
//! atomic increment. [`KvCounterStore`] therefore reads the current window,
//! computes the next one, and writes it back. Two handlers that read the
//! same value before either writes will both be admitted: a concurrent burst
//! may over-admit, but the stored count never runs ahead of the number of
//! requests actually seen, so the limiter never under-admits.
//!
//! Stored values are JSON: `{"count": 2, "expires_at": 1700000060}`.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{window_end, CounterStore, WindowCount};

/// Minimal key-value backend.
#[async_trait]
pub trait KeyValue: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value`; backends with native expiry should drop it after
    /// `ttl_secs`.
    async fn put(&self, key: &str, value: String, ttl_secs: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct StoredWindow {
    count: u64,
    expires_at: i64,
}

/// Read-modify-write counter store. Approximate under concurrency.
pub struct KvCounterStore<K> {
    kv: K,
}

impl<K: KeyValue> KvCounterStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn backend(&self) -> &K {
        &self.kv
    }
}

#[async_trait]
impl<K: KeyValue> CounterStore for KvCounterStore<K> {
    async fn increment_and_read(
        &self,
        key: &str,
        window_secs: u64,
        now: i64,
    ) -> Result<WindowCount> {
        // An unreadable value is treated like a missing one.
        let current = self
            .kv
            .get(key)
            .await?
            .and_then(|raw| serde_json::from_str::<StoredWindow>(&raw).ok());

        let next = match current {
            Some(w) if w.expires_at > now => StoredWindow {
                count: w.count + 1,
                expires_at: w.expires_at,
            },
            _ => StoredWindow {
                count: 1,
                expires_at: window_end(now, window_secs),
            },
        };

        let ttl = next.expires_at.saturating_sub(now).max(1) as u64;
        self.kv.put(key, serde_json::to_string(&next)?, ttl).await?;

        Ok(WindowCount {
            count: next.count,
            expires_at: next.expires_at,
        })
    }
}

/// `HashMap`-backed [`KeyValue`]. Records the TTL but does not expire
/// entries itself; [`KvCounterStore`] checks window expiry on read.
#[derive(Debug, Default)]
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, (String, u64)>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL most recently written for `key`.
    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.get(key).map(|(_, ttl)| *ttl))
    }
}

#[async_trait]
impl KeyValue for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("kv lock poisoned"))?;
        Ok(entries.get(key).map(|(v, _)| v.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("kv lock poisoned"))?;
        entries.insert(key.to_string(), (value, ttl_secs));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{RateLimitPolicy, RateLimiter};
    use std::sync::Arc;

    /// Yields between the read and the caller's write, forcing the
    /// read-modify-write race to interleave.
    #[derive(Default)]
    struct YieldingKv {
        inner: InMemoryKv,
    }

    #[async_trait]
    impl KeyValue for YieldingKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let value = self.inner.get(key).await?;
            tokio::task::yield_now().await;
            Ok(value)
        }

        async fn put(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
            self.inner.put(key, value, ttl_secs).await
        }
    }

    #[tokio::test]
    async fn test_sequential_counting_is_exact() {
        let store = KvCounterStore::new(InMemoryKv::new());
        let a = store.increment_and_read("rl:x", 60, 1_000).await.unwrap();
        let b = store.increment_and_read("rl:x", 60, 1_010).await.unwrap();
        let c = store.increment_and_read("rl:x", 60, 1_060).await.unwrap();

        assert_eq!(a, WindowCount { count: 1, expires_at: 1_060 });
        assert_eq!(b, WindowCount { count: 2, expires_at: 1_060 });
        assert_eq!(c, WindowCount { count: 1, expires_at: 1_120 });
        assert_eq!(store.backend().ttl_of("rl:x"), Some(60));
    }

    #[tokio::test]
    async fn test_ttl_tracks_remaining_window() {
        let store = KvCounterStore::new(InMemoryKv::new());
        store.increment_and_read("rl:x", 60, 1_000).await.unwrap();
        store.increment_and_read("rl:x", 60, 1_045).await.unwrap();
        assert_eq!(store.backend().ttl_of("rl:x"), Some(15));
    }

    #[tokio::test]
    async fn test_corrupt_value_starts_fresh_window() {
        let kv = InMemoryKv::new();
        kv.put("rl:x", "not json".into(), 60).await.unwrap();
        let store = KvCounterStore::new(kv);
        let w = store.increment_and_read("rl:x", 60, 500).await.unwrap();
        assert_eq!(w, WindowCount { count: 1, expires_at: 560 });
    }

    #[tokio::test]
    async fn test_concurrent_burst_may_over_admit_but_never_under_admits() {
        let policy = RateLimitPolicy::default();
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(KvCounterStore::new(YieldingKv::default())),
            clock,
            policy,
        ));

        let burst = 10;
        let mut handles = Vec::new();
        for _ in 0..burst {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("198.51.100.7").await.unwrap().allowed
            }));
        }
        let mut burst_admitted = 0u64;
        for h in handles {
            if h.await.unwrap() {
                burst_admitted += 1;
            }
        }
        assert!(burst_admitted >= policy.limit);
        assert!(burst_admitted <= burst);

        // Once the burst has settled, sequential traffic is counted from the
        // stored value and the window closes within `limit` more requests.
        let mut sequential_admitted = 0u64;
        for _ in 0..10 {
            if limiter.check("198.51.100.7").await.unwrap().allowed {
                sequential_admitted += 1;
            }
        }
        assert!(sequential_admitted <= policy.limit);
        assert!(burst_admitted + sequential_admitted <= burst + policy.limit);
    }
}
