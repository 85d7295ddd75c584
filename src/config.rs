//! Configuration parsing and validation.
//!
//! The service is configured from a TOML file. Every section and field has a
//! default, so an empty file is a valid (Cloudflare-backed) configuration.
//! After parsing, a fixed set of deployment environment variables may
//! override individual fields, and the result is validated once.
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8787"
//! version = "1.4.0"
//!
//! [retrieval]
//! default_top_k = 5
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//!
//! [vector]
//! provider = "memory"
//! path = "./data/courses.ndjson"
//!
//! [generation]
//! provider = "ollama"
//! model = "llama3.1"
//!
//! [cors]
//! allowed_origins = ["https://courses.example.edu"]
//! ```
//!
//! # Environment overrides
//!
//! | Variable | Field |
//! |----------|-------|
//! | `CF_EMBED_MODEL` | `embedding.model` |
//! | `CF_CHAT_MODEL` | `generation.model` |
//! | `CF_TOPK` | `retrieval.default_top_k` |
//! | `GEN_TEMPERATURE` | `generation.temperature` |
//! | `GEN_MAX_TOKENS` | `generation.max_tokens` |
//! | `APP_VERSION` | `server.version` |
//!
//! The Cloudflare API token is read from `CLOUDFLARE_API_TOKEN` and never
//! stored in the file.

use anyhow::{bail, Context, Result};
use course_rag_core::context::DEFAULT_MAX_FRAGMENT_CHARS;
use course_rag_core::cors::CorsPolicy;
use course_rag_core::ratelimit::RateLimitPolicy;
use course_rag_core::validate::TopKBounds;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable holding the Cloudflare API token.
pub const CLOUDFLARE_TOKEN_ENV: &str = "CLOUDFLARE_API_TOKEN";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub cloudflare: CloudflareConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Reported by `GET /version` and the `X-Version` header.
    pub version: String,
    /// Value of the `X-Service` header.
    pub service_name: String,
    /// Message returned by `GET /`.
    pub greeting: String,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            version: "dev".to_string(),
            service_name: "course-rag".to_string(),
            greeting: "Hello Titan!".to_string(),
            max_body_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub min_top_k: usize,
    pub max_top_k: usize,
    pub max_fragment_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            min_top_k: 1,
            max_top_k: 10,
            max_fragment_chars: DEFAULT_MAX_FRAGMENT_CHARS,
        }
    }
}

impl RetrievalConfig {
    pub fn bounds(&self) -> TopKBounds {
        TopKBounds {
            min: self.min_top_k,
            max: self.max_top_k,
            default: self.default_top_k,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"cloudflare"` or `"ollama"`.
    pub provider: String,
    pub model: String,
    /// Base URL for Ollama.
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "cloudflare".to_string(),
            model: "@cf/baai/bge-base-en-v1.5".to_string(),
            url: None,
            timeout_secs: 10,
            max_retries: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VectorConfig {
    /// `"cloudflare"` (Vectorize) or `"memory"` (NDJSON file).
    pub provider: String,
    /// Vectorize index name.
    pub index: String,
    /// NDJSON file of `{id, values, metadata}` records for `memory`.
    pub path: Option<PathBuf>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            provider: "cloudflare".to_string(),
            index: "courses".to_string(),
            path: None,
            timeout_secs: 10,
            max_retries: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    /// `"cloudflare"` or `"ollama"`.
    pub provider: String,
    pub model: String,
    pub url: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "cloudflare".to_string(),
            model: "@cf/meta/llama-3.1-8b-instruct-fast".to_string(),
            url: None,
            temperature: 0.2,
            max_tokens: 350,
            timeout_secs: 30,
            max_retries: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CloudflareConfig {
    pub account_id: Option<String>,
    pub api_base: String,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            api_base: "https://api.cloudflare.com/client/v4".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub limit: u64,
    pub window_secs: u64,
    /// Headers consulted, in order, for the client identity.
    pub identity_headers: Vec<String>,
    /// Counter backend: `"memory"` (per process) or `"cloudflare_kv"`.
    pub store: String,
    /// Workers KV namespace for `cloudflare_kv`.
    pub kv_namespace_id: Option<String>,
    pub store_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 3,
            window_secs: 60,
            identity_headers: vec!["CF-Connecting-IP".to_string(), "X-Forwarded-For".to_string()],
            store: "memory".to_string(),
            kv_namespace_id: None,
            store_timeout_ms: 500,
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            limit: self.limit,
            window_secs: self.window_secs,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_missing_origin: bool,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_missing_origin: true,
            max_age_secs: 86_400,
        }
    }
}

impl CorsConfig {
    pub fn policy(&self) -> CorsPolicy {
        let mut policy = CorsPolicy::new(self.allowed_origins.iter().cloned());
        policy.allow_missing_origin = self.allow_missing_origin;
        policy.max_age_secs = self.max_age_secs;
        policy
    }
}

impl Config {
    /// Apply the deployment environment overrides using `lookup` to read
    /// variables. Empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CF_EMBED_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = get("CF_CHAT_MODEL") {
            self.generation.model = v;
        }
        if let Some(v) = get("CF_TOPK") {
            self.retrieval.default_top_k = v
                .trim()
                .parse()
                .with_context(|| format!("CF_TOPK must be an integer, got '{}'", v))?;
        }
        if let Some(v) = get("GEN_TEMPERATURE") {
            self.generation.temperature = v
                .trim()
                .parse()
                .with_context(|| format!("GEN_TEMPERATURE must be a number, got '{}'", v))?;
        }
        if let Some(v) = get("GEN_MAX_TOKENS") {
            self.generation.max_tokens = v
                .trim()
                .parse()
                .with_context(|| format!("GEN_MAX_TOKENS must be an integer, got '{}'", v))?;
        }
        if let Some(v) = get("APP_VERSION") {
            self.server.version = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if r.min_top_k == 0 {
            bail!("retrieval.min_top_k must be >= 1");
        }
        if r.min_top_k > r.max_top_k {
            bail!(
                "retrieval.min_top_k ({}) must be <= retrieval.max_top_k ({})",
                r.min_top_k,
                r.max_top_k
            );
        }
        if !r.bounds().contains(r.default_top_k) {
            bail!(
                "retrieval.default_top_k ({}) must be within [{}, {}]",
                r.default_top_k,
                r.min_top_k,
                r.max_top_k
            );
        }
        if r.max_fragment_chars == 0 {
            bail!("retrieval.max_fragment_chars must be > 0");
        }

        if self.server.max_body_bytes == 0 {
            bail!("server.max_body_bytes must be > 0");
        }

        for (section, timeout, retries) in [
            ("embedding", self.embedding.timeout_secs, self.embedding.max_retries),
            ("vector", self.vector.timeout_secs, self.vector.max_retries),
            ("generation", self.generation.timeout_secs, self.generation.max_retries),
        ] {
            if timeout == 0 {
                bail!("{}.timeout_secs must be > 0", section);
            }
            if retries > MAX_RETRIES {
                bail!("{}.max_retries must be <= {}", section, MAX_RETRIES);
            }
        }

        match self.embedding.provider.as_str() {
            "cloudflare" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be cloudflare or ollama.",
                other
            ),
        }
        match self.generation.provider.as_str() {
            "cloudflare" | "ollama" => {}
            other => bail!(
                "Unknown generation provider: '{}'. Must be cloudflare or ollama.",
                other
            ),
        }
        match self.vector.provider.as_str() {
            "cloudflare" => {}
            "memory" => {
                if self.vector.path.is_none() {
                    bail!("vector.path is required when vector.provider is 'memory'");
                }
            }
            other => bail!(
                "Unknown vector provider: '{}'. Must be cloudflare or memory.",
                other
            ),
        }
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }
        if self.generation.model.trim().is_empty() {
            bail!("generation.model must not be empty");
        }
        if !(0.0..=5.0).contains(&self.generation.temperature) {
            bail!("generation.temperature must be in [0.0, 5.0]");
        }
        if self.generation.max_tokens == 0 {
            bail!("generation.max_tokens must be > 0");
        }

        if self.uses_cloudflare() && self.cloudflare.account_id.is_none() {
            bail!("cloudflare.account_id is required when a cloudflare provider is selected");
        }

        if self.rate_limit.enabled {
            let rl = &self.rate_limit;
            if rl.limit == 0 {
                bail!("rate_limit.limit must be >= 1");
            }
            if rl.window_secs == 0 {
                bail!("rate_limit.window_secs must be >= 1");
            }
            if rl.window_secs > MAX_WINDOW_SECS {
                bail!("rate_limit.window_secs must be <= {}", MAX_WINDOW_SECS);
            }
            if rl.store_timeout_ms == 0 {
                bail!("rate_limit.store_timeout_ms must be > 0");
            }
            match rl.store.as_str() {
                "memory" => {}
                "cloudflare_kv" => {
                    if rl.kv_namespace_id.as_deref().map_or(true, |ns| ns.trim().is_empty()) {
                        bail!("rate_limit.kv_namespace_id is required when rate_limit.store is 'cloudflare_kv'");
                    }
                }
                other => bail!(
                    "Unknown rate_limit store: '{}'. Must be memory or cloudflare_kv.",
                    other
                ),
            }
        }

        Ok(())
    }

    /// Whether any collaborator talks to the Cloudflare REST API.
    pub fn uses_cloudflare(&self) -> bool {
        self.embedding.provider == "cloudflare"
            || self.generation.provider == "cloudflare"
            || self.vector.provider == "cloudflare"
            || self.uses_kv_store()
    }

    /// Whether rate-limit counters live in Workers KV.
    pub fn uses_kv_store(&self) -> bool {
        self.rate_limit.enabled && self.rate_limit.store == "cloudflare_kv"
    }
}

/// Upper bound on `max_retries` for any collaborator.
pub const MAX_RETRIES: u32 = 10;

/// One day; longer windows are rejected.
pub const MAX_WINDOW_SECS: u64 = 86_400;

/// Parse TOML text, apply overrides from `lookup`, and validate.
pub fn parse_config<F>(content: &str, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.apply_env_overrides(lookup)?;
    config.validate()?;
    Ok(config)
}

/// Read, override from the process environment, and validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content, |key| std::env::var(key).ok())
}
