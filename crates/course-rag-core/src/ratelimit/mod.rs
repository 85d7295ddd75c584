//! Fixed-window rate limiting.
//!
//! [`RateLimiter::check`] counts requests per client identity through a
//! [`CounterStore`]. The store owns window bookkeeping: the first request it
//! sees for a key opens a window of `window_secs`, later requests in the same
//! window increment it, and an expired window is implicitly replaced by a
//! fresh one.
//!
//! # Consistency
//!
//! The counter is shared by every concurrent handler (and, in a distributed
//! deployment, by every node), but no store is required to be linearizable.
//! [`InMemoryCounterStore`] is exact within a process; [`KvCounterStore`]
//! performs read-modify-write against an eventually consistent key-value
//! backend and may briefly over-admit under a concurrent burst. The
//! guarantee is "about `limit` requests per window per identity": counting
//! never under-admits, and sequential traffic is counted exactly.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`CounterStore`] | `increment_and_read(key, window, now)` abstraction |
//! | [`InMemoryCounterStore`] | Mutex-guarded map, exact in-process |
//! | [`KvCounterStore`] | Read-modify-write over a [`KeyValue`] backend |
//! | [`RateLimiter`] | Maps counts to allow/deny decisions |

pub mod kv;
pub mod memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::clock::Clock;

pub use kv::{InMemoryKv, KeyValue, KvCounterStore};
pub use memory::InMemoryCounterStore;

/// Unix second at which a window opened at `now` ends. Saturates instead
/// of wrapping for windows beyond `i64::MAX` seconds.
pub fn window_end(now: i64, window_secs: u64) -> i64 {
    now.saturating_add(i64::try_from(window_secs).unwrap_or(i64::MAX))
}

/// Counter state after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the active window, including this one.
    pub count: u64,
    /// Unix second at which the active window ends.
    pub expires_at: i64,
}

/// Shared per-key counter with fixed-window expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one request for `key` at time `now`.
    ///
    /// Opens a new window ending at `now + window_secs` when the key has no
    /// live window, otherwise increments the live one.
    async fn increment_and_read(&self, key: &str, window_secs: u64, now: i64)
        -> Result<WindowCount>;
}

/// Requests allowed per identity per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u64,
    pub window_secs: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            window_secs: 60,
        }
    }
}

/// Outcome of a [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    /// `limit - count` while allowed, `0` once denied.
    pub remaining: u64,
    /// Unix second at which the active window ends.
    pub reset_at: i64,
    /// Unix second the decision was made at.
    pub now: i64,
}

impl RateDecision {
    /// Seconds until the window resets; at least 1.
    pub fn reset_in_secs(&self) -> u64 {
        self.reset_at.saturating_sub(self.now).max(1) as u64
    }

    /// Value for the `Retry-After` header on a denial.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_in_secs()
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, policy: RateLimitPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Count a request for `identity` and decide whether it may proceed.
    pub async fn check(&self, identity: &str) -> Result<RateDecision> {
        let now = self.clock.now_unix();
        let key = format!("rl:{identity}");
        let window = self
            .store
            .increment_and_read(&key, self.policy.window_secs, now)
            .await?;

        let allowed = window.count <= self.policy.limit;
        let remaining = if allowed {
            self.policy.limit - window.count
        } else {
            0
        };

        Ok(RateDecision {
            allowed,
            limit: self.policy.limit,
            remaining,
            reset_at: window.expires_at,
            now,
        })
    }
}
