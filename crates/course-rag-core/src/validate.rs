//! Input validation for `POST /ask`.
//!
//! Pure and side-effect free: no network or store access happens here, so
//! a request rejected by this module never reaches the retrieval stage.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::QuestionRequest;

/// Why an `/ask` body was rejected. The `Display` text is the exact
/// client-facing error message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Body must be JSON object")]
    NotAnObject,
    #[error("Missing 'question'")]
    MissingQuestion,
    #[error("Invalid 'topK'")]
    InvalidTopK,
}

/// Allowed range and default for `topK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopKBounds {
    pub min: usize,
    pub max: usize,
    pub default: usize,
}

impl Default for TopKBounds {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            default: 5,
        }
    }
}

impl TopKBounds {
    pub fn contains(&self, k: usize) -> bool {
        (self.min..=self.max).contains(&k)
    }
}

/// Parse raw body bytes into a JSON object.
///
/// A JSON string whose content is itself a JSON object is unwrapped once,
/// since some clients double-encode the payload.
pub fn parse_body(bytes: &[u8]) -> Result<Map<String, Value>, ValidationError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| ValidationError::NotAnObject)?;
    match value {
        Value::Object(map) => Ok(map),
        Value::String(inner) => match serde_json::from_str::<Value>(&inner) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(ValidationError::NotAnObject),
        },
        _ => Err(ValidationError::NotAnObject),
    }
}

/// Validate a parsed body into a [`QuestionRequest`].
///
/// - `question` must be a string that is non-empty after trimming.
/// - `topK` may be absent or `null` (use `bounds.default`); otherwise it
///   must be a JSON integer inside `bounds`. Strings and floats are
///   rejected, never coerced.
pub fn validate_question(
    body: &Map<String, Value>,
    bounds: &TopKBounds,
) -> Result<QuestionRequest, ValidationError> {
    let question = body
        .get("question")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or(ValidationError::MissingQuestion)?;

    let top_k = match body.get("topK") {
        None | Some(Value::Null) => bounds.default,
        Some(v) => v
            .as_i64()
            .filter(|k| *k >= 0)
            .map(|k| k as usize)
            .filter(|k| bounds.contains(*k))
            .ok_or(ValidationError::InvalidTopK)?,
    };

    Ok(QuestionRequest {
        question: question.to_string(),
        top_k,
    })
}

/// [`parse_body`] followed by [`validate_question`].
pub fn validate_request(
    bytes: &[u8],
    bounds: &TopKBounds,
) -> Result<QuestionRequest, ValidationError> {
    let body = parse_body(bytes)?;
    validate_question(&body, bounds)
}
