//! In-process [`CounterStore`].
//!
//! Every increment runs under one `std::sync::Mutex`, so counting is exact
//! for a single process. Expired windows are swept once the map grows past
//! a threshold.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{window_end, CounterStore, WindowCount};

const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    expires_at: i64,
}

/// Exact, single-process counter store.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked keys, live or not yet swept.
    pub fn len(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_and_read(
        &self,
        key: &str,
        window_secs: u64,
        now: i64,
    ) -> Result<WindowCount> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| anyhow!("rate-limit counter lock poisoned"))?;

        if windows.len() >= SWEEP_THRESHOLD {
            windows.retain(|_, w| w.expires_at > now);
        }

        let window = windows
            .entry(key.to_string())
            .and_modify(|w| {
                if w.expires_at <= now {
                    *w = Window {
                        count: 1,
                        expires_at: window_end(now, window_secs),
                    };
                } else {
                    w.count += 1;
                }
            })
            .or_insert(Window {
                count: 1,
                expires_at: window_end(now, window_secs),
            });

        Ok(WindowCount {
            count: window.count,
            expires_at: window.expires_at,
        })
    }
}
