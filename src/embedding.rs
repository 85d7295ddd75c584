//! Embedding backends.
//!
//! Implementations of [`Embedder`]:
//! - **[`CloudflareEmbedder`]**: Workers AI text-embedding model.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed`.
//!
//! Use [`create_embedder`] to build the one selected by configuration.

use anyhow::{bail, Result};
use async_trait::async_trait;
use course_rag_core::upstream::{Embedder, UpstreamFailure};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::cloudflare::{self, CloudflareApi};
use crate::config::EmbeddingConfig;
use crate::http::{as_f32_vec, JsonTransport};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Build the embedder named by `config.provider`.
pub fn create_embedder(
    config: &EmbeddingConfig,
    cloudflare: Option<&CloudflareApi>,
) -> Result<Arc<dyn Embedder>> {
    let transport = JsonTransport::new(
        "embedding service",
        Duration::from_secs(config.timeout_secs),
        config.max_retries,
    )?;
    match config.provider.as_str() {
        "cloudflare" => {
            let Some(api) = cloudflare else {
                bail!("Cloudflare embedding provider requires [cloudflare] settings");
            };
            Ok(Arc::new(CloudflareEmbedder::new(
                api.clone(),
                &config.model,
                transport,
            )))
        }
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(
            config.url.as_deref().unwrap_or(DEFAULT_OLLAMA_URL),
            &config.model,
            transport,
        ))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Cloudflare Workers AI ============

/// Calls `POST /accounts/{id}/ai/run/{model}` with `{"text": [question]}`
/// and reads `result.data[0]`.
pub struct CloudflareEmbedder {
    api: CloudflareApi,
    model: String,
    transport: JsonTransport,
}

impl CloudflareEmbedder {
    pub fn new(api: CloudflareApi, model: &str, transport: JsonTransport) -> Self {
        Self {
            api,
            model: model.to_string(),
            transport,
        }
    }
}

#[async_trait]
impl Embedder for CloudflareEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamFailure> {
        let body = json!({ "text": [text] });
        let response = self
            .transport
            .post_json(&self.api.ai_run_url(&self.model), Some(self.api.token()), &body)
            .await?;
        parse_cloudflare_response(cloudflare::unwrap_result(response)?)
    }
}

fn parse_cloudflare_response(result: Value) -> Result<Vec<f32>, UpstreamFailure> {
    let first = result
        .get("data")
        .and_then(Value::as_array)
        .and_then(|data| data.first())
        .ok_or_else(|| UpstreamFailure::malformed("embedding result has no data"))?;
    as_f32_vec(first)
        .ok_or_else(|| UpstreamFailure::malformed("embedding is not an array of numbers"))
}

// ============ Ollama ============

/// Calls `POST {url}/api/embed` and reads `embeddings[0]`.
///
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    url: String,
    model: String,
    transport: JsonTransport,
}

impl OllamaEmbedder {
    pub fn new(url: &str, model: &str, transport: JsonTransport) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            transport,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamFailure> {
        let body = json!({
            "model": self.model,
            "input": text,
        });
        let response = self
            .transport
            .post_json(&format!("{}/api/embed", self.url), None, &body)
            .await?;
        parse_ollama_response(&response)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<f32>, UpstreamFailure> {
    let first = json
        .get("embeddings")
        .and_then(Value::as_array)
        .and_then(|e| e.first())
        .ok_or_else(|| UpstreamFailure::malformed("missing embeddings array"))?;
    as_f32_vec(first).ok_or_else(|| UpstreamFailure::malformed("embedding is not an array"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cloudflare_response() {
        let v = parse_cloudflare_response(json!({"shape": [1, 3], "data": [[0.1, 0.2, 0.3]]}))
            .unwrap();
        assert_eq!(v, vec![0.1, 0.2, 0.3]);

        assert!(parse_cloudflare_response(json!({"data": []})).is_err());
        assert!(parse_cloudflare_response(json!({"shape": [0]})).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let v = parse_ollama_response(&json!({"model": "m", "embeddings": [[1.0, 0.0]]})).unwrap();
        assert_eq!(v, vec![1.0, 0.0]);

        let err = parse_ollama_response(&json!({"embedding": [1.0]})).unwrap_err();
        assert!(matches!(err, UpstreamFailure::Malformed(_)));
    }

    #[test]
    fn test_create_embedder_selects_provider() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: "nomic-embed-text".into(),
            ..Default::default()
        };
        let embedder = create_embedder(&config, None).unwrap();
        assert_eq!(embedder.model_name(), "nomic-embed-text");

        let cloudflare = EmbeddingConfig::default();
        assert!(create_embedder(&cloudflare, None).is_err());
        let api = CloudflareApi::new("https://x", "acct", "tok");
        let embedder = create_embedder(&cloudflare, Some(&api)).unwrap();
        assert_eq!(embedder.model_name(), "@cf/baai/bge-base-en-v1.5");
    }
}
