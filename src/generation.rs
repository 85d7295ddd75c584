//! Generation client: prompt assembly, the model call, and answer cleanup.

use course_rag_core::context::{build_prompt, strip_citations};
use course_rag_core::upstream::{TextGenerator, UpstreamFailure};
use std::sync::Arc;
use std::time::Duration;

use crate::http::with_deadline;

#[derive(Clone)]
pub struct GenerationClient {
    generator: Arc<dyn TextGenerator>,
    deadline: Duration,
}

impl GenerationClient {
    pub fn new(generator: Arc<dyn TextGenerator>, deadline: Duration) -> Self {
        Self {
            generator,
            deadline,
        }
    }

    pub fn generator(&self) -> &dyn TextGenerator {
        self.generator.as_ref()
    }

    /// Answer `question` from `context`, with inline citation markers
    /// removed. An answer that is empty after cleanup is malformed.
    pub async fn generate(&self, context: &str, question: &str) -> Result<String, UpstreamFailure> {
        let prompt = build_prompt(question, context);
        let raw = with_deadline(self.deadline, self.generator.generate(&prompt)).await?;
        let answer = strip_citations(&raw);
        if answer.is_empty() {
            return Err(UpstreamFailure::malformed("empty generation result"));
        }
        Ok(answer)
    }
}
