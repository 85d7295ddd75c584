//! Vector-search backends.
//!
//! - **[`VectorizeIndex`]**: Cloudflare Vectorize v2 `query`.
//! - **[`MemoryIndex`]**: an NDJSON export of the index held in memory and
//!   searched by brute-force cosine similarity. Suitable for a few thousand
//!   course records.
//!
//! Both return at most `top_k` matches, best first, with metadata passed
//! through untouched.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use course_rag_core::models::{CourseMetadata, Match};
use course_rag_core::upstream::{UpstreamFailure, VectorIndex};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cloudflare::{self, CloudflareApi};
use crate::config::VectorConfig;
use crate::http::JsonTransport;

/// Build the index named by `config.provider`.
pub fn create_index(
    config: &VectorConfig,
    cloudflare: Option<&CloudflareApi>,
) -> Result<Arc<dyn VectorIndex>> {
    match config.provider.as_str() {
        "cloudflare" => {
            let Some(api) = cloudflare else {
                bail!("Vectorize index requires [cloudflare] settings");
            };
            let transport = JsonTransport::new(
                "vector search",
                Duration::from_secs(config.timeout_secs),
                config.max_retries,
            )?;
            Ok(Arc::new(VectorizeIndex::new(
                api.clone(),
                &config.index,
                transport,
            )))
        }
        "memory" => {
            let Some(path) = config.path.as_deref() else {
                bail!("vector.path is required for the memory index");
            };
            Ok(Arc::new(MemoryIndex::load(path)?))
        }
        other => bail!("Unknown vector provider: {}", other),
    }
}

// ============ Cloudflare Vectorize ============

pub struct VectorizeIndex {
    api: CloudflareApi,
    index: String,
    transport: JsonTransport,
}

impl VectorizeIndex {
    pub fn new(api: CloudflareApi, index: &str, transport: JsonTransport) -> Self {
        Self {
            api,
            index: index.to_string(),
            transport,
        }
    }
}

#[async_trait]
impl VectorIndex for VectorizeIndex {
    fn name(&self) -> &str {
        &self.index
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Match>, UpstreamFailure> {
        let body = json!({
            "vector": vector,
            "topK": top_k,
            "returnValues": false,
            "returnMetadata": "all",
        });
        let response = self
            .transport
            .post_json(
                &self.api.vectorize_query_url(&self.index),
                Some(self.api.token()),
                &body,
            )
            .await?;
        parse_vectorize_matches(cloudflare::unwrap_result(response)?)
    }
}

fn parse_vectorize_matches(mut result: Value) -> Result<Vec<Match>, UpstreamFailure> {
    let matches = result
        .get_mut("matches")
        .map(Value::take)
        .filter(Value::is_array)
        .ok_or_else(|| UpstreamFailure::malformed("expected 'matches' list"))?;
    serde_json::from_value(matches)
        .map_err(|e| UpstreamFailure::malformed(format!("invalid match record: {}", e)))
}

// ============ In-memory NDJSON index ============

/// One line of the NDJSON export.
#[derive(Debug, Deserialize)]
struct VectorRecord {
    id: String,
    values: Vec<f32>,
    #[serde(default)]
    metadata: CourseMetadata,
}

#[derive(Debug)]
pub struct MemoryIndex {
    name: String,
    dims: usize,
    records: Vec<VectorRecord>,
}

impl MemoryIndex {
    /// Load `{id, values, metadata}` records, one JSON object per line.
    /// Blank lines are skipped; every vector must have the same length.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vector file: {}", path.display()))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "memory".to_string());
        let index = Self::from_ndjson(&name, &content)?;
        tracing::info!(
            index = %index.name,
            records = index.len(),
            dims = index.dims,
            "loaded in-memory vector index"
        );
        Ok(index)
    }

    pub fn from_ndjson(name: &str, content: &str) -> Result<Self> {
        let mut records: Vec<VectorRecord> = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: VectorRecord = serde_json::from_str(line)
                .with_context(|| format!("Invalid vector record on line {}", lineno + 1))?;
            if record.values.is_empty() {
                bail!("Vector record '{}' has no values", record.id);
            }
            if let Some(first) = records.first() {
                if first.values.len() != record.values.len() {
                    bail!(
                        "Vector record '{}' has {} dims, expected {}",
                        record.id,
                        record.values.len(),
                        first.values.len()
                    );
                }
            }
            records.push(record);
        }

        let dims = records.first().map(|r| r.values.len()).unwrap_or(0);
        Ok(Self {
            name: name.to_string(),
            dims,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Match>, UpstreamFailure> {
        if self.records.is_empty() {
            return Ok(Vec::new());
        }
        if vector.len() != self.dims {
            return Err(UpstreamFailure::malformed(format!(
                "query vector has {} dims, index has {}",
                vector.len(),
                self.dims
            )));
        }

        let mut scored: Vec<(f32, &VectorRecord)> = self
            .records
            .iter()
            .map(|r| (cosine_similarity(vector, &r.values), r))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, r)| Match {
                id: r.id.clone(),
                score: f64::from(score),
                metadata: r.metadata.clone(),
            })
            .collect())
    }
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for mismatched lengths or
/// zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
