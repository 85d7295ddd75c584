//! HTTP transport shared by the concrete collaborators.
//!
//! [`JsonTransport::post_json`] posts a JSON body and decodes the JSON
//! response; [`JsonTransport::get_text`] and [`JsonTransport::put_text`]
//! move raw string values for key-value storage. Every call yields an
//! [`UpstreamFailure`] on error:
//!
//! - reqwest timeouts → [`UpstreamFailure::Timeout`]
//! - connection errors and non-2xx statuses → [`UpstreamFailure::Transport`]
//! - undecodable bodies → [`UpstreamFailure::Malformed`]
//!
//! # Retry Strategy
//!
//! Retries are off by default (`max_retries = 0`). When enabled:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: base, 2×base, 4×base, ... (capped at 2^5 × base)
//!
//! The per-attempt timeout bounds one request. A caller that also wraps the
//! whole call in [`with_deadline`] should size that deadline with
//! [`call_budget`], otherwise the retries never get a chance to run.
//!
//! Failure text never includes the request URL, since it may carry an
//! account identifier.

use anyhow::Result;
use course_rag_core::upstream::UpstreamFailure;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

const ERROR_BODY_SNIPPET: usize = 200;

/// First retry delay unless overridden with [`JsonTransport::with_backoff_base`].
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Delay before retry number `attempt` (1-based).
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(5))
}

/// Worst-case wall time of one call: every attempt runs to its timeout and
/// every backoff is slept.
pub fn call_budget(attempt_timeout: Duration, max_retries: u32, backoff_base: Duration) -> Duration {
    (1..=max_retries).fold(
        attempt_timeout.saturating_mul(max_retries.saturating_add(1)),
        |total, attempt| total.saturating_add(backoff_delay(backoff_base, attempt)),
    )
}

#[derive(Debug, Clone)]
pub struct JsonTransport {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
    /// Service name used in log lines and failure text.
    service: &'static str,
}

impl JsonTransport {
    pub fn new(service: &'static str, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            timeout,
            max_retries,
            backoff_base: DEFAULT_BACKOFF_BASE,
            service,
        })
    }

    /// Override the first backoff delay.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deadline that covers every attempt and backoff of one call.
    pub fn budget(&self) -> Duration {
        call_budget(self.timeout, self.max_retries, self.backoff_base)
    }

    /// POST `body` to `url` and decode the JSON response.
    pub async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &Value,
    ) -> Result<Value, UpstreamFailure> {
        let response = self
            .send(false, || authorize(self.client.post(url).json(body), bearer))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            UpstreamFailure::malformed(format!("{} returned invalid JSON: {}", self.service, e))
        })
    }

    /// GET `url` as text; `404 Not Found` is `Ok(None)`.
    pub async fn get_text(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<Option<String>, UpstreamFailure> {
        let response = self
            .send(true, || authorize(self.client.get(url), bearer))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        response
            .text()
            .await
            .map(Some)
            .map_err(|e| self.map_reqwest_error(e))
    }

    /// PUT `body` to `url` as the raw request body.
    pub async fn put_text(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &str,
    ) -> Result<(), UpstreamFailure> {
        self.send(false, || {
            authorize(self.client.put(url).body(body.to_string()), bearer)
        })
        .await?;
        Ok(())
    }

    /// Send the request built by `build`, retrying per the strategy above.
    /// Returns the first 2xx response, or a 404 when `not_found_ok`.
    async fn send<F>(&self, not_found_ok: bool, build: F) -> Result<Response, UpstreamFailure>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(self.backoff_base, attempt);
                tracing::debug!(
                    service = self.service,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upstream call"
                );
                tokio::time::sleep(delay).await;
            }

            let response = match build().send().await {
                Ok(response) => response,
                Err(e) => {
                    last_err = Some(self.map_reqwest_error(e));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() || (not_found_ok && status == StatusCode::NOT_FOUND) {
                return Ok(response);
            }

            let body_text = response.text().await.unwrap_or_default();
            let failure = UpstreamFailure::transport(format!(
                "{} returned HTTP {}: {}",
                self.service,
                status.as_u16(),
                snippet(&body_text)
            ));

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_err = Some(failure);
                continue;
            }
            return Err(failure);
        }

        Err(last_err.unwrap_or_else(|| {
            UpstreamFailure::transport(format!("{} failed after retries", self.service))
        }))
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> UpstreamFailure {
        if e.is_timeout() {
            UpstreamFailure::Timeout {
                after_ms: self.timeout.as_millis() as u64,
            }
        } else {
            UpstreamFailure::transport(format!(
                "{} unreachable: {}",
                self.service,
                e.without_url()
            ))
        }
    }
}

fn authorize(request: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
    match bearer {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

fn snippet(body: &str) -> &str {
    course_rag_core::context::truncate_chars(body.trim(), ERROR_BODY_SNIPPET)
}

/// Run `fut` with a whole-call deadline; expiry becomes
/// [`UpstreamFailure::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, UpstreamFailure>
where
    F: std::future::Future<Output = Result<T, UpstreamFailure>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamFailure::Timeout {
            after_ms: deadline.as_millis() as u64,
        }),
    }
}

/// Extract a float vector from a JSON array.
pub fn as_f32_vec(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}
