//! Core data models for the question-answering pipeline.
//!
//! A [`QuestionRequest`] flows in, [`Match`]es come back from the vector
//! index, and the caller receives either an [`AnswerEnvelope`] or an
//! [`ErrorEnvelope`]. The two envelopes are mutually exclusive.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A validated `/ask` request.
///
/// Produced by [`crate::validate::validate_question`]; `question` is already
/// trimmed and non-empty, `top_k` is within the configured bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionRequest {
    pub question: String,
    pub top_k: usize,
}

/// Metadata record stored alongside each course vector.
///
/// Field names follow the column headers of the course catalogue the index
/// was built from. Unknown keys are kept in `extra` so nothing is lost on
/// the way through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourseMetadata {
    /// Course code, e.g. `"CPSC 131"`.
    #[serde(
        rename = "Course",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub course: Option<String>,
    /// Human-readable course title.
    #[serde(
        rename = "Course Name",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub course_name: Option<String>,
    /// Instructor full name.
    #[serde(
        rename = "First Last",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub instructor: Option<String>,
    #[serde(
        rename = "Description",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
    #[serde(
        rename = "Prerequisite",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub prerequisite: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Accepts strings, numbers, and booleans as text; `null` becomes `None`.
/// Catalogue columns are not consistently typed (course numbers may arrive
/// as integers).
fn lenient_string<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(de)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// One vector-search hit.
///
/// Higher `score` means more similar. Order within a result list is
/// significant and is preserved all the way into the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metadata: CourseMetadata,
}

/// Structured citation returned to the client for each match.
///
/// Excludes description and prerequisite text; absent fields serialize as
/// `null` so the response shape is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub score: f64,
    pub course: Option<String>,
    #[serde(rename = "courseName")]
    pub course_name: Option<String>,
    pub instructor: Option<String>,
}

impl From<&Match> for Source {
    fn from(m: &Match) -> Self {
        Self {
            id: m.id.clone(),
            score: m.score,
            course: m.metadata.course.clone(),
            course_name: m.metadata.course_name.clone(),
            instructor: m.metadata.instructor.clone(),
        }
    }
}

/// Successful `/ask` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerEnvelope {
    pub answer: String,
    pub sources: Vec<Source>,
}

impl AnswerEnvelope {
    /// Build the envelope, projecting every match in order.
    pub fn new(answer: String, matches: &[Match]) -> Self {
        Self {
            answer,
            sources: matches.iter().map(Source::from).collect(),
        }
    }
}

/// Error payload. `detail` is omitted from the JSON when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
