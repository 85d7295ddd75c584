//! Collaborator interfaces consumed by the pipeline.
//!
//! Every external call returns `Result<_, UpstreamFailure>`: a small closed
//! set of failure kinds that the pipeline maps to the HTTP error taxonomy.
//! Implementations must not leak credentials or full URLs into the failure
//! text; the message ends up in the client-visible `detail` field.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Match;

/// Tagged failure of a single collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamFailure {
    /// The call did not complete within its deadline.
    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
    /// The service could not be reached or answered with an error status.
    #[error("transport error: {0}")]
    Transport(String),
    /// The service answered, but not with what was expected.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl UpstreamFailure {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Turns question text into an embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, e.g. `"@cf/baai/bge-base-en-v1.5"`.
    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamFailure>;
}

/// Nearest-neighbour lookup over course vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Index name used in logs.
    fn name(&self) -> &str;

    /// Up to `top_k` matches, best first. Returning fewer is not an error.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<Match>, UpstreamFailure>;
}

/// Produces answer text from a fully assembled prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, UpstreamFailure>;
}
