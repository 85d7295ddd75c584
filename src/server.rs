//! HTTP server.
//!
//! Exposes the question-answering pipeline over a small JSON API built on
//! axum.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Greeting (smoke test) |
//! | `GET` | `/health` | Liveness; not rate limited |
//! | `GET` | `/version` | Configured version string; not rate limited |
//! | `POST` | `/ask` | `{question, topK?}` → `{answer, sources}`; rate limited |
//! | `OPTIONS` | any | CORS preflight, `204` |
//!
//! Anything else is `404 {"error": "Not Found"}`.
//!
//! # Layers (outer → inner)
//!
//! 1. `TraceLayer`: one span per request.
//! 2. [`cors_guard`]: preflight, origin allow-list, service headers.
//! 3. `CatchPanicLayer`: a panicking handler becomes
//!    `500 {"error": "unhandled_exception", "detail": ...}`.
//! 4. [`rate_limit`]: `/ask` only.
//!
//! # Usage
//!
//! ```bash
//! course-rag --config ./config/course-rag.toml serve
//! curl -s localhost:8787/ask -H 'content-type: application/json' \
//!      -d '{"question": "Who teaches CPSC 131?", "topK": 3}'
//! ```

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Json, Router};
use course_rag_core::clock::{Clock, SystemClock};
use course_rag_core::cors::CorsPolicy;
use course_rag_core::models::AnswerEnvelope;
use course_rag_core::ratelimit::{CounterStore, RateLimiter};
use course_rag_core::validate::TopKBounds;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::counter_store::create_counter_store;
use crate::error::{panic_response, ApiError};
use crate::identity::{IdentityResolver, TrustedHeaderIdentity};
use crate::middleware::{cors_guard, rate_limit};
use crate::pipeline::{self, build_pipeline, Pipeline};

/// Values echoed by the informational endpoints and service headers.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service_name: String,
    pub version: String,
    pub greeting: String,
}

/// Shared application state passed to handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// `None` when rate limiting is disabled.
    pub limiter: Option<Arc<RateLimiter>>,
    pub identity: Arc<dyn IdentityResolver>,
    pub cors: Arc<CorsPolicy>,
    pub info: Arc<ServiceInfo>,
    pub bounds: TopKBounds,
    pub store_timeout: Duration,
    pub max_body_bytes: usize,
}

impl AppState {
    /// Assemble state from configuration around an existing pipeline,
    /// counter store, and clock.
    pub fn new(
        config: &Config,
        pipeline: Pipeline,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let limiter = config
            .rate_limit
            .enabled
            .then(|| Arc::new(RateLimiter::new(store, clock, config.rate_limit.policy())));
        let identity = TrustedHeaderIdentity::new(&config.rate_limit.identity_headers)?;

        Ok(Self {
            pipeline: Arc::new(pipeline),
            limiter,
            identity: Arc::new(identity),
            cors: Arc::new(config.cors.policy()),
            info: Arc::new(ServiceInfo {
                service_name: config.server.service_name.clone(),
                version: config.server.version.clone(),
                greeting: config.server.greeting.clone(),
            }),
            bounds: config.retrieval.bounds(),
            store_timeout: Duration::from_millis(config.rate_limit.store_timeout_ms),
            max_body_bytes: config.server.max_body_bytes,
        })
    }

    /// Replace the identity resolver.
    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }
}

/// Build the router with all routes and layers.
pub fn router(state: AppState) -> Router {
    let ask = Router::new()
        .route("/ask", post(handle_ask))
        .route_layer(from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/version", get(handle_version))
        .merge(ask)
        .fallback(handle_not_found)
        .method_not_allowed_fallback(handle_not_found)
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(from_fn_with_state(state.clone(), cors_guard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_on<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Starts the HTTP server.
///
/// Builds the configured collaborators, binds `[server].bind`, and runs
/// until Ctrl+C or SIGTERM.
pub async fn run_server(config: &Config) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    let store = create_counter_store(config)?;
    let state = AppState::new(config, pipeline, store, Arc::new(SystemClock))?;

    let listener = TcpListener::bind(&config.server.bind).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        version = %config.server.version,
        embedding = %state.pipeline.retrieval().embedder().model_name(),
        index = %state.pipeline.retrieval().index().name(),
        generation = %state.pipeline.generation().generator().model_name(),
        "course-rag listening"
    );

    serve_on(listener, state, shutdown_signal()).await?;
    tracing::info!("server stopped");
    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

// ============ GET / ============

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

async fn handle_root(State(state): State<AppState>) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: state.info.greeting.clone(),
    })
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ============ GET /version ============

#[derive(Serialize)]
struct VersionResponse {
    version: String,
}

async fn handle_version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        version: state.info.version.clone(),
    })
}

// ============ POST /ask ============

/// Handler for `POST /ask`.
///
/// The body is read as raw bytes so that every parse failure, including
/// oversized bodies, maps onto the 400 `Body must be JSON object` error
/// rather than axum's plain-text rejections.
async fn handle_ask(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<AnswerEnvelope>, ApiError> {
    let body = body.map_err(|e| ApiError::UnreadableBody(e.body_text()))?;
    let request = pipeline::validate(&body, &state.bounds)?;
    let envelope = state.pipeline.answer(&request).await?;
    Ok(Json(envelope))
}

async fn handle_not_found() -> ApiError {
    ApiError::NotFound
}
