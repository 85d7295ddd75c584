//! Text-generation backends.
//!
//! - **[`CloudflareGenerator`]**: Workers AI text model, prompt mode.
//! - **[`OllamaGenerator`]**: local Ollama `/api/chat`, non-streaming.

use anyhow::{bail, Result};
use async_trait::async_trait;
use course_rag_core::upstream::{TextGenerator, UpstreamFailure};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::cloudflare::{self, CloudflareApi};
use crate::config::GenerationConfig;
use crate::embedding::DEFAULT_OLLAMA_URL;
use crate::http::JsonTransport;

/// Sampling parameters forwarded to the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl From<&GenerationConfig> for SamplingParams {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Build the generator named by `config.provider`.
pub fn create_generator(
    config: &GenerationConfig,
    cloudflare: Option<&CloudflareApi>,
) -> Result<Arc<dyn TextGenerator>> {
    let transport = JsonTransport::new(
        "generation service",
        Duration::from_secs(config.timeout_secs),
        config.max_retries,
    )?;
    let params = SamplingParams::from(config);
    match config.provider.as_str() {
        "cloudflare" => {
            let Some(api) = cloudflare else {
                bail!("Cloudflare generation provider requires [cloudflare] settings");
            };
            Ok(Arc::new(CloudflareGenerator::new(
                api.clone(),
                &config.model,
                params,
                transport,
            )))
        }
        "ollama" => Ok(Arc::new(OllamaGenerator::new(
            config.url.as_deref().unwrap_or(DEFAULT_OLLAMA_URL),
            &config.model,
            params,
            transport,
        ))),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Calls `POST /accounts/{id}/ai/run/{model}` with
/// `{"prompt", "temperature", "max_tokens"}` and reads `result.response`.
pub struct CloudflareGenerator {
    api: CloudflareApi,
    model: String,
    params: SamplingParams,
    transport: JsonTransport,
}

impl CloudflareGenerator {
    pub fn new(
        api: CloudflareApi,
        model: &str,
        params: SamplingParams,
        transport: JsonTransport,
    ) -> Self {
        Self {
            api,
            model: model.to_string(),
            params,
            transport,
        }
    }
}

#[async_trait]
impl TextGenerator for CloudflareGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, UpstreamFailure> {
        let body = json!({
            "prompt": prompt,
            "temperature": self.params.temperature,
            "max_tokens": self.params.max_tokens,
        });
        let response = self
            .transport
            .post_json(&self.api.ai_run_url(&self.model), Some(self.api.token()), &body)
            .await?;
        let result = cloudflare::unwrap_result(response)?;
        result
            .get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| UpstreamFailure::malformed("generation result has no 'response'"))
    }
}

/// Calls `POST {url}/api/chat` with a single user message and
/// `"stream": false`, reading `message.content`.
pub struct OllamaGenerator {
    url: String,
    model: String,
    params: SamplingParams,
    transport: JsonTransport,
}

impl OllamaGenerator {
    pub fn new(url: &str, model: &str, params: SamplingParams, transport: JsonTransport) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            params,
            transport,
        }
    }
}

#[async_trait]
impl TextGenerator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, UpstreamFailure> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": false,
            "options": {
                "temperature": self.params.temperature,
                "num_predict": self.params.max_tokens,
            },
        });
        let response = self
            .transport
            .post_json(&format!("{}/api/chat", self.url), None, &body)
            .await?;
        response
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| UpstreamFailure::malformed("chat response has no message.content"))
    }
}
