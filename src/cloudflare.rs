//! Cloudflare REST API endpoints and response envelope.
//!
//! Workers AI and Vectorize both answer with
//! `{"success": bool, "errors": [...], "result": {...}}`. [`unwrap_result`]
//! checks the envelope and hands back `result`. Workers KV values are read
//! and written raw, outside the envelope.

use anyhow::{anyhow, bail, Result};
use reqwest::Url;
use course_rag_core::upstream::UpstreamFailure;
use serde_json::Value;

use crate::config::{CloudflareConfig, CLOUDFLARE_TOKEN_ENV};

/// Account-scoped API coordinates plus the bearer token.
#[derive(Clone)]
pub struct CloudflareApi {
    api_base: String,
    account_id: String,
    token: String,
}

impl std::fmt::Debug for CloudflareApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareApi")
            .field("api_base", &self.api_base)
            .field("account_id", &self.account_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl CloudflareApi {
    pub fn new(
        api_base: impl Into<String>,
        account_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            account_id: account_id.into(),
            token: token.into(),
        }
    }

    /// Build from the `[cloudflare]` section and `CLOUDFLARE_API_TOKEN`.
    pub fn from_config(config: &CloudflareConfig) -> Result<Self> {
        let Some(account_id) = config.account_id.clone() else {
            bail!("cloudflare.account_id is not set");
        };
        let token = match std::env::var(CLOUDFLARE_TOKEN_ENV) {
            Ok(t) if !t.trim().is_empty() => t,
            _ => bail!("{} environment variable not set", CLOUDFLARE_TOKEN_ENV),
        };
        Ok(Self::new(config.api_base.clone(), account_id, token))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `POST {base}/accounts/{id}/ai/run/{model}`
    pub fn ai_run_url(&self, model: &str) -> String {
        format!(
            "{}/accounts/{}/ai/run/{}",
            self.api_base, self.account_id, model
        )
    }

    /// `POST {base}/accounts/{id}/vectorize/v2/indexes/{index}/query`
    pub fn vectorize_query_url(&self, index: &str) -> String {
        format!(
            "{}/accounts/{}/vectorize/v2/indexes/{}/query",
            self.api_base, self.account_id, index
        )
    }

    /// `{base}/accounts/{id}/storage/kv/namespaces/{ns}/values/{key}`,
    /// with `?expiration_ttl=` when `ttl_secs` is given. The key is
    /// percent-encoded as a single path segment.
    pub fn kv_value_url(&self, namespace: &str, key: &str, ttl_secs: Option<u64>) -> Result<String> {
        let mut url = Url::parse(&format!(
            "{}/accounts/{}/storage/kv/namespaces/{}/values",
            self.api_base, self.account_id, namespace
        ))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("cloudflare.api_base is not a base URL"))?
            .push(key);
        if let Some(ttl) = ttl_secs {
            url.query_pairs_mut()
                .append_pair("expiration_ttl", &ttl.to_string());
        }
        Ok(url.into())
    }
}

/// Check the `success` flag and return the `result` payload.
pub fn unwrap_result(body: Value) -> Result<Value, UpstreamFailure> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let message = body
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(UpstreamFailure::transport(format!(
            "cloudflare reported failure: {}",
            message
        )));
    }

    match body {
        Value::Object(mut map) => map
            .remove("result")
            .filter(|r| !r.is_null())
            .ok_or_else(|| UpstreamFailure::malformed("missing 'result'")),
        _ => Err(UpstreamFailure::malformed("response is not a JSON object")),
    }
}
