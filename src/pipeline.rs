//! Request-orchestration pipeline.
//!
//! [`Pipeline::answer`] walks the stages strictly in order:
//!
//! ```text
//! Validating → Embedding → Searching → ContextBuilding → Generating → Done
//! ```
//!
//! `Validating` is entered through [`validate`], which the `/ask` handler
//! calls on the raw body before any rate-limited work reaches a
//! collaborator; a rejected body is a [`ValidationError`], not a
//! [`PipelineError`]. [`Pipeline::answer`] then starts at `Embedding` with
//! an already-valid [`QuestionRequest`]. Any failure ends the walk;
//! intermediate results are dropped and only a [`PipelineError`] naming the
//! failed stage is returned. The pipeline never retries.

use course_rag_core::context::build_context;
use course_rag_core::models::{AnswerEnvelope, Match, QuestionRequest};
use course_rag_core::upstream::UpstreamFailure;
use course_rag_core::validate::{validate_request, TopKBounds, ValidationError};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::cloudflare::CloudflareApi;
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::generation::GenerationClient;
use crate::http::{call_budget, DEFAULT_BACKOFF_BASE};
use crate::llm::create_generator;
use crate::retrieval::RetrievalClient;
use crate::vector_index::create_index;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Embedding,
    Searching,
    ContextBuilding,
    Generating,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "validating",
            Stage::Embedding => "embedding",
            Stage::Searching => "searching",
            Stage::ContextBuilding => "context_building",
            Stage::Generating => "generating",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A collaborator failure, tagged with the stage it ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} stage failed: {failure}")]
pub struct PipelineError {
    pub stage: Stage,
    pub failure: UpstreamFailure,
}

impl PipelineError {
    /// Client-facing error message for the failed stage.
    pub fn message(&self) -> &'static str {
        match self.stage {
            Stage::Embedding => "Embedding failed",
            Stage::Searching => "Vector search failed",
            Stage::Generating => "Answer generation failed",
            _ => "Pipeline failed",
        }
    }
}

pub struct Pipeline {
    retrieval: RetrievalClient,
    generation: GenerationClient,
    max_fragment_chars: usize,
}

impl Pipeline {
    pub fn new(
        retrieval: RetrievalClient,
        generation: GenerationClient,
        max_fragment_chars: usize,
    ) -> Self {
        Self {
            retrieval,
            generation,
            max_fragment_chars,
        }
    }

    pub fn retrieval(&self) -> &RetrievalClient {
        &self.retrieval
    }

    pub fn generation(&self) -> &GenerationClient {
        &self.generation
    }

    /// Run the full pipeline for one validated question.
    pub async fn answer(&self, request: &QuestionRequest) -> Result<AnswerEnvelope, PipelineError> {
        let started = Instant::now();
        let matches = self.retrieve(&request.question, request.top_k).await?;

        enter(Stage::ContextBuilding);
        let context = build_context(&matches, request.top_k, self.max_fragment_chars);

        enter(Stage::Generating);
        let answer = self
            .generation
            .generate(&context, &request.question)
            .await
            .map_err(|failure| fail(Stage::Generating, failure))?;

        enter(Stage::Done);
        tracing::info!(
            top_k = request.top_k,
            matches = matches.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "answered question"
        );
        Ok(AnswerEnvelope::new(answer, &matches))
    }

    /// Embedding and search only.
    pub async fn retrieve(&self, question: &str, top_k: usize) -> Result<Vec<Match>, PipelineError> {
        enter(Stage::Embedding);
        let vector = self
            .retrieval
            .embed(question)
            .await
            .map_err(|failure| fail(Stage::Embedding, failure))?;

        enter(Stage::Searching);
        self.retrieval
            .search(&vector, top_k)
            .await
            .map_err(|failure| fail(Stage::Searching, failure))
    }
}

/// The `Validating` stage: parse and check a raw `/ask` body.
pub fn validate(body: &[u8], bounds: &TopKBounds) -> Result<QuestionRequest, ValidationError> {
    enter(Stage::Validating);
    validate_request(body, bounds).inspect_err(|e| {
        tracing::debug!(stage = %Stage::Validating, error = %e, "request rejected");
    })
}

/// Build the configured collaborators and wire them into a [`Pipeline`].
pub fn build_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let cloudflare = if config.uses_cloudflare() {
        Some(CloudflareApi::from_config(&config.cloudflare)?)
    } else {
        None
    };

    let embedder = create_embedder(&config.embedding, cloudflare.as_ref())?;
    let index = create_index(&config.vector, cloudflare.as_ref())?;
    let generator = create_generator(&config.generation, cloudflare.as_ref())?;

    let retrieval = RetrievalClient::new(
        embedder,
        index,
        stage_deadline(config.embedding.timeout_secs, config.embedding.max_retries),
        stage_deadline(config.vector.timeout_secs, config.vector.max_retries),
    );
    let generation = GenerationClient::new(
        generator,
        stage_deadline(config.generation.timeout_secs, config.generation.max_retries),
    );
    Ok(Pipeline::new(
        retrieval,
        generation,
        config.retrieval.max_fragment_chars,
    ))
}

/// Whole-call deadline for a collaborator configured with a per-attempt
/// timeout and retry count.
fn stage_deadline(timeout_secs: u64, max_retries: u32) -> Duration {
    call_budget(Duration::from_secs(timeout_secs), max_retries, DEFAULT_BACKOFF_BASE)
}

fn enter(stage: Stage) {
    tracing::debug!(%stage, "pipeline stage");
}

fn fail(stage: Stage, failure: UpstreamFailure) -> PipelineError {
    tracing::warn!(%stage, error = %failure, "pipeline stage failed");
    PipelineError { stage, failure }
}
