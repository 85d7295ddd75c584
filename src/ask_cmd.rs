//! One-shot CLI commands: `ask` and `query`.
//!
//! Both build the configured collaborators exactly as `serve` does, run a
//! single request, and print to stdout. Rate limiting and CORS do not
//! apply.

use anyhow::{anyhow, Result};
use course_rag_core::models::{AnswerEnvelope, Match, QuestionRequest};
use course_rag_core::validate::validate_question;
use serde_json::json;
use std::fmt::Write as _;

use crate::config::Config;
use crate::pipeline::{build_pipeline, PipelineError};

/// Validate CLI input with the same rules as `POST /ask`.
fn to_request(config: &Config, question: &str, top_k: Option<usize>) -> Result<QuestionRequest> {
    let mut body = json!({ "question": question });
    if let Some(k) = top_k {
        body["topK"] = json!(k);
    }
    let map = body
        .as_object()
        .ok_or_else(|| anyhow!("request body is not an object"))?;
    validate_question(map, &config.retrieval.bounds()).map_err(|e| {
        let bounds = config.retrieval.bounds();
        anyhow!("{} (topK must be within [{}, {}])", e, bounds.min, bounds.max)
    })
}

fn pipeline_error(e: PipelineError) -> anyhow::Error {
    anyhow!("{}: {}", e.message(), e.failure)
}

/// Run the full pipeline once and print the answer.
pub async fn run_ask(config: &Config, question: &str, top_k: Option<usize>, as_json: bool) -> Result<()> {
    let request = to_request(config, question, top_k)?;
    let pipeline = build_pipeline(config)?;
    let envelope = pipeline.answer(&request).await.map_err(pipeline_error)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    } else {
        print!("{}", format_answer(&envelope));
    }
    Ok(())
}

/// Embed and search only; print ranked matches.
pub async fn run_query(config: &Config, text: &str, top_k: Option<usize>) -> Result<()> {
    let request = to_request(config, text, top_k)?;
    let pipeline = build_pipeline(config)?;
    let matches = pipeline
        .retrieve(&request.question, request.top_k)
        .await
        .map_err(pipeline_error)?;

    if matches.is_empty() {
        println!("No results.");
        return Ok(());
    }
    print!("{}", format_matches(&matches));
    Ok(())
}

pub fn format_answer(envelope: &AnswerEnvelope) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", envelope.answer);
    if envelope.sources.is_empty() {
        return out;
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Sources:");
    for (i, source) in envelope.sources.iter().enumerate() {
        let course = source.course.as_deref().unwrap_or("?");
        let title = source.course_name.as_deref().unwrap_or("(untitled)");
        let _ = write!(out, "{}. [{:.3}] {} — {}", i + 1, source.score, course, title);
        if let Some(instructor) = source.instructor.as_deref() {
            let _ = write!(out, " ({})", instructor);
        }
        let _ = writeln!(out);
    }
    out
}

pub fn format_matches(matches: &[Match]) -> String {
    let mut out = String::new();
    for (i, m) in matches.iter().enumerate() {
        let md = &m.metadata;
        let title = md
            .course_name
            .as_deref()
            .or(md.course.as_deref())
            .unwrap_or("(untitled)");
        let _ = writeln!(out, "{}. [{:.3}] {}", i + 1, m.score, title);
        if let Some(course) = md.course.as_deref() {
            let _ = writeln!(out, "    course: {}", course);
        }
        if let Some(instructor) = md.instructor.as_deref() {
            let _ = writeln!(out, "    instructor: {}", instructor);
        }
        let _ = writeln!(out, "    id: {}", m.id);
        let _ = writeln!(out);
    }
    out
}
