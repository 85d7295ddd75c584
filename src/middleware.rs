//! Request guards applied around the handlers.
//!
//! - [`cors_guard`] wraps every route: answers preflight, rejects denied
//!   origins with 403 before anything else runs, and stamps CORS and
//!   service headers on every response.
//! - [`rate_limit`] wraps `/ask` only: counts the request and either
//!   short-circuits with 429 or attaches `X-RateLimit-*` headers to the
//!   handler's response.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use course_rag_core::ratelimit::RateDecision;
use std::net::SocketAddr;

use crate::error::ApiError;
use crate::server::AppState;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
pub const X_SERVICE: &str = "x-service";
pub const X_VERSION: &str = "x-version";

pub async fn cors_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let decision = state.cors.decide(origin.as_deref());

    let (mut response, cors_headers) = if request.method() == Method::OPTIONS {
        (
            StatusCode::NO_CONTENT.into_response(),
            state.cors.preflight_headers(&decision),
        )
    } else if !decision.is_allowed() {
        tracing::info!(origin = ?origin, path = %request.uri().path(), "origin denied");
        (
            ApiError::CorsDenied.into_response(),
            state.cors.response_headers(&decision),
        )
    } else {
        let response = next.run(request).await;
        (response, state.cors.response_headers(&decision))
    };

    let headers = response.headers_mut();
    for (name, value) in cors_headers {
        insert(headers, name, &value);
    }
    insert(headers, X_SERVICE, &state.info.service_name);
    insert(headers, X_VERSION, &state.info.version);
    response
}

pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(limiter) = state.limiter.as_ref() else {
        return next.run(request).await;
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let Some(identity) = state.identity.resolve(request.headers(), peer) else {
        tracing::warn!("cannot identify client; request not rate limited");
        return next.run(request).await;
    };

    let decision = match tokio::time::timeout(state.store_timeout, limiter.check(&identity)).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "rate-limit store failed; admitting request");
            return next.run(request).await;
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = state.store_timeout.as_millis() as u64,
                "rate-limit store timed out; admitting request"
            );
            return next.run(request).await;
        }
    };

    if !decision.allowed {
        tracing::info!(
            identity = %identity,
            retry_after = decision.retry_after_secs(),
            "rate limit exceeded"
        );
        let policy = limiter.policy();
        let mut response = ApiError::RateLimited {
            limit: policy.limit,
            window_secs: policy.window_secs,
        }
        .into_response();
        let headers = response.headers_mut();
        stamp_rate_headers(headers, &decision);
        insert(
            headers,
            axum::http::header::RETRY_AFTER.as_str(),
            &decision.retry_after_secs().to_string(),
        );
        return response;
    }

    let mut response = next.run(request).await;
    stamp_rate_headers(response.headers_mut(), &decision);
    response
}

fn stamp_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    insert(headers, X_RATELIMIT_LIMIT, &decision.limit.to_string());
    insert(headers, X_RATELIMIT_REMAINING, &decision.remaining.to_string());
    insert(headers, X_RATELIMIT_RESET, &decision.reset_in_secs().to_string());
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!(header = name, "skipping unrepresentable header"),
    }
}
