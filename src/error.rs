//! HTTP error taxonomy.
//!
//! | Kind | Status | Message |
//! |------|--------|---------|
//! | `bad_request` | 400 | `Body must be JSON object`, `Missing 'question'`, `Invalid 'topK'` |
//! | `cors_denied` | 403 | `CORS not allowed` |
//! | `not_found` | 404 | `Not Found` |
//! | `rate_limited` | 429 | `Rate limit exceeded` |
//! | `upstream_*_error` | 502 | `Embedding failed`, `Vector search failed`, `Answer generation failed` |
//! | `unhandled_exception` | 500 | `unhandled_exception` |
//!
//! Every variant renders as an [`ErrorEnvelope`] with
//! `Content-Type: application/json`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use course_rag_core::models::ErrorEnvelope;
use course_rag_core::validate::ValidationError;
use std::any::Any;
use thiserror::Error;

use crate::pipeline::{PipelineError, Stage};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The body could not be read (too large, connection error).
    #[error("Body must be JSON object")]
    UnreadableBody(String),
    #[error("CORS not allowed")]
    CorsDenied,
    #[error("Not Found")]
    NotFound,
    #[error("Rate limit exceeded")]
    RateLimited { limit: u64, window_secs: u64 },
    #[error("{}", .0.message())]
    Upstream(#[from] PipelineError),
    #[error("unhandled_exception")]
    Unhandled(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::UnreadableBody(_) => StatusCode::BAD_REQUEST,
            ApiError::CorsDenied => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unhandled(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) | ApiError::UnreadableBody(_) => "bad_request",
            ApiError::CorsDenied => "cors_denied",
            ApiError::NotFound => "not_found",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Upstream(e) => match e.stage {
                Stage::Embedding => "upstream_embedding_error",
                Stage::Searching => "upstream_search_error",
                Stage::Generating => "upstream_generation_error",
                _ => "upstream_error",
            },
            ApiError::Unhandled(_) => "unhandled_exception",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            ApiError::UnreadableBody(detail) | ApiError::Unhandled(detail) => Some(detail.clone()),
            ApiError::RateLimited { limit, window_secs } => Some(if *window_secs == 60 {
                format!("{} requests per minute allowed for this IP.", limit)
            } else {
                format!(
                    "{} requests per {} seconds allowed for this IP.",
                    limit, window_secs
                )
            }),
            ApiError::Upstream(e) => Some(e.failure.to_string()),
            _ => None,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.to_string(),
            detail: self.detail(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), detail = ?self.detail(), "request failed");
        } else {
            tracing::debug!(kind = self.kind(), status = status.as_u16(), "request rejected");
        }
        (status, Json(self.envelope())).into_response()
    }
}

/// Converts a caught handler panic into the 500 envelope.
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    ApiError::Unhandled(detail).into_response()
}
