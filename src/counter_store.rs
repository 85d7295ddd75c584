//! Rate-limit counter backends.
//!
//! `[rate_limit] store` picks where per-client window counts live:
//!
//! | store | backend |
//! |-------|---------|
//! | `memory` | [`InMemoryCounterStore`], one process |
//! | `cloudflare_kv` | [`KvCounterStore`] over [`CloudflareKv`], shared across instances |
//!
//! Workers KV has no atomic increment, so the KV store is read-modify-write
//! and may over-admit a concurrent burst.

use anyhow::Result;
use async_trait::async_trait;
use course_rag_core::ratelimit::{CounterStore, InMemoryCounterStore, KeyValue, KvCounterStore};
use std::sync::Arc;
use std::time::Duration;

use crate::cloudflare::CloudflareApi;
use crate::config::Config;
use crate::http::JsonTransport;

/// Workers KV rejects `expiration_ttl` values below this.
pub const KV_MIN_TTL_SECS: u64 = 60;

/// [`KeyValue`] over the Workers KV REST API.
pub struct CloudflareKv {
    api: CloudflareApi,
    namespace: String,
    transport: JsonTransport,
}

impl CloudflareKv {
    pub fn new(api: CloudflareApi, namespace: impl Into<String>, transport: JsonTransport) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            transport,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl KeyValue for CloudflareKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let url = self.api.kv_value_url(&self.namespace, key, None)?;
        Ok(self.transport.get_text(&url, Some(self.api.token())).await?)
    }

    async fn put(&self, key: &str, value: String, ttl_secs: u64) -> Result<()> {
        let ttl = ttl_secs.max(KV_MIN_TTL_SECS);
        let url = self.api.kv_value_url(&self.namespace, key, Some(ttl))?;
        self.transport
            .put_text(&url, Some(self.api.token()), &value)
            .await?;
        Ok(())
    }
}

/// Build the counter store named by `[rate_limit] store`.
pub fn create_counter_store(config: &Config) -> Result<Arc<dyn CounterStore>> {
    if !config.uses_kv_store() {
        return Ok(Arc::new(InMemoryCounterStore::new()));
    }

    let api = CloudflareApi::from_config(&config.cloudflare)?;
    let namespace = config
        .rate_limit
        .kv_namespace_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("rate_limit.kv_namespace_id is not set"))?;
    let transport = JsonTransport::new(
        "workers-kv",
        Duration::from_millis(config.rate_limit.store_timeout_ms),
        0,
    )?;
    tracing::info!(namespace = %namespace, "rate-limit counters in Workers KV");
    Ok(Arc::new(KvCounterStore::new(CloudflareKv::new(
        api, namespace, transport,
    ))))
}
