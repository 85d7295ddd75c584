//! Concrete collaborators against a local mock of the upstream APIs.
//!
//! One axum server stands in for Workers AI, Vectorize, and Ollama. It
//! records every request and answers with whatever the test scripts. A
//! separate stateful mock plays Workers KV.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use course_rag::cloudflare::CloudflareApi;
use course_rag::config::Config;
use course_rag::counter_store::CloudflareKv;
use course_rag::embedding::{CloudflareEmbedder, OllamaEmbedder};
use course_rag::http::JsonTransport;
use course_rag::llm::{CloudflareGenerator, OllamaGenerator, SamplingParams};
use course_rag::pipeline::{build_pipeline, Stage};
use course_rag::vector_index::VectorizeIndex;
use course_rag_core::clock::ManualClock;
use course_rag_core::models::QuestionRequest;
use course_rag_core::ratelimit::{KvCounterStore, RateLimitPolicy, RateLimiter};
use course_rag_core::upstream::{Embedder, TextGenerator, UpstreamFailure, VectorIndex};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

const ACCOUNT: &str = "acct-1";
const TOKEN: &str = "secret-token";

#[derive(Debug, Clone)]
struct Seen {
    path: String,
    auth: Option<String>,
    body: Value,
}

type Responder = Arc<dyn Fn(&str, &Value) -> (StatusCode, String) + Send + Sync>;

#[derive(Clone)]
struct MockUpstream {
    seen: Arc<Mutex<Vec<Seen>>>,
    respond: Responder,
    delay: Duration,
}

async fn record(
    State(mock): State<MockUpstream>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    mock.seen.lock().unwrap().push(Seen {
        path: uri.path().to_string(),
        auth,
        body: body.clone(),
    });

    if !mock.delay.is_zero() {
        tokio::time::sleep(mock.delay).await;
    }
    let (status, text) = (mock.respond)(uri.path(), &body);
    (status, [("content-type", "application/json")], text).into_response()
}

struct Upstream {
    base: String,
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Upstream {
    async fn start<F>(delay: Duration, respond: F) -> Self
    where
        F: Fn(&str, &Value) -> (StatusCode, String) + Send + Sync + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mock = MockUpstream {
            seen: seen.clone(),
            respond: Arc::new(respond),
            delay,
        };
        let app = Router::new().fallback(record).with_state(mock);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{}", addr),
            seen,
        }
    }

    async fn json(body: Value) -> Self {
        Self::start(Duration::ZERO, move |_, _| (StatusCode::OK, body.to_string())).await
    }

    fn cloudflare(&self) -> CloudflareApi {
        CloudflareApi::new(format!("{}/client/v4/", self.base), ACCOUNT, TOKEN)
    }

    fn requests(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

fn transport(timeout_ms: u64, retries: u32) -> JsonTransport {
    JsonTransport::new("test upstream", Duration::from_millis(timeout_ms), retries)
        .unwrap()
        .with_backoff_base(Duration::from_millis(1))
}

fn params() -> SamplingParams {
    SamplingParams {
        temperature: 0.2,
        max_tokens: 350,
    }
}

// ============ Cloudflare ============

#[tokio::test]
async fn test_cloudflare_embedder() {
    let upstream = Upstream::json(json!({
        "success": true,
        "errors": [],
        "result": { "shape": [1, 3], "data": [[0.25, 0.5, 0.75]] }
    }))
    .await;

    let embedder = CloudflareEmbedder::new(
        upstream.cloudflare(),
        "@cf/baai/bge-base-en-v1.5",
        transport(2_000, 0),
    );
    let vector = embedder.embed("Who teaches CPSC 131?").await.unwrap();
    assert_eq!(vector, vec![0.25, 0.5, 0.75]);

    let seen = upstream.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].path,
        "/client/v4/accounts/acct-1/ai/run/@cf/baai/bge-base-en-v1.5"
    );
    assert_eq!(seen[0].auth.as_deref(), Some("Bearer secret-token"));
    assert_eq!(seen[0].body, json!({"text": ["Who teaches CPSC 131?"]}));
}

#[tokio::test]
async fn test_cloudflare_reported_failure_is_transport() {
    let upstream = Upstream::json(json!({
        "success": false,
        "errors": [{ "code": 5006, "message": "model not found" }],
        "result": null
    }))
    .await;

    let embedder = CloudflareEmbedder::new(upstream.cloudflare(), "@cf/missing", transport(2_000, 0));
    let err = embedder.embed("hi").await.unwrap_err();
    assert!(matches!(err, UpstreamFailure::Transport(ref m) if m.contains("model not found")));
}

#[tokio::test]
async fn test_vectorize_query() {
    let upstream = Upstream::json(json!({
        "success": true,
        "result": {
            "count": 2,
            "matches": [
                {
                    "id": "CPSC 131_Jane Doe_1",
                    "score": 0.87,
                    "metadata": {
                        "Course": "CPSC 131",
                        "Course Name": "Data Structures",
                        "First Last": "Jane Doe",
                        "Units": 3
                    }
                },
                { "id": "bare", "score": 0.5 }
            ]
        }
    }))
    .await;

    let index = VectorizeIndex::new(upstream.cloudflare(), "courses", transport(2_000, 0));
    let matches = index.query(&[0.1, 0.2], 4).await.unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].id, "CPSC 131_Jane Doe_1");
    assert_eq!(matches[0].metadata.instructor.as_deref(), Some("Jane Doe"));
    assert_eq!(matches[1].metadata.course, None);

    let seen = upstream.requests();
    assert_eq!(
        seen[0].path,
        "/client/v4/accounts/acct-1/vectorize/v2/indexes/courses/query"
    );
    assert_eq!(seen[0].body["topK"], json!(4));
    assert_eq!(seen[0].body["returnValues"], json!(false));
    assert_eq!(seen[0].body["returnMetadata"], json!("all"));
    assert_eq!(seen[0].body["vector"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_vectorize_without_matches_is_malformed() {
    let upstream = Upstream::json(json!({"success": true, "result": {"count": 0}})).await;
    let index = VectorizeIndex::new(upstream.cloudflare(), "courses", transport(2_000, 0));
    let err = index.query(&[0.1], 3).await.unwrap_err();
    assert_eq!(err, UpstreamFailure::malformed("expected 'matches' list"));
}

#[tokio::test]
async fn test_cloudflare_generator() {
    let upstream = Upstream::json(json!({
        "success": true,
        "result": { "response": "CPSC 131 is taught by Jane Doe." }
    }))
    .await;

    let generator = CloudflareGenerator::new(
        upstream.cloudflare(),
        "@cf/meta/llama-3.1-8b-instruct",
        params(),
        transport(2_000, 0),
    );
    let text = generator.generate("PROMPT").await.unwrap();
    assert_eq!(text, "CPSC 131 is taught by Jane Doe.");

    let seen = upstream.requests();
    assert_eq!(
        seen[0].body,
        json!({"prompt": "PROMPT", "temperature": 0.2, "max_tokens": 350})
    );
}

// ============ Ollama ============

#[tokio::test]
async fn test_ollama_embedder() {
    let upstream = Upstream::json(json!({"model": "nomic-embed-text", "embeddings": [[1.0, 0.0]]})).await;

    let embedder = OllamaEmbedder::new(&format!("{}/", upstream.base), "nomic-embed-text", transport(2_000, 0));
    assert_eq!(embedder.embed("hello").await.unwrap(), vec![1.0, 0.0]);

    let seen = upstream.requests();
    assert_eq!(seen[0].path, "/api/embed");
    assert_eq!(seen[0].auth, None);
    assert_eq!(seen[0].body, json!({"model": "nomic-embed-text", "input": "hello"}));
}

#[tokio::test]
async fn test_ollama_generator() {
    let upstream = Upstream::json(json!({
        "model": "llama3.2",
        "message": { "role": "assistant", "content": "Jane Doe [1]." },
        "done": true
    }))
    .await;

    let generator = OllamaGenerator::new(&upstream.base, "llama3.2", params(), transport(2_000, 0));
    assert_eq!(generator.generate("PROMPT").await.unwrap(), "Jane Doe [1].");

    let seen = upstream.requests();
    assert_eq!(seen[0].path, "/api/chat");
    assert_eq!(seen[0].body["stream"], json!(false));
    assert_eq!(seen[0].body["messages"][0]["content"], json!("PROMPT"));
    assert_eq!(seen[0].body["options"]["num_predict"], json!(350));
}

#[tokio::test]
async fn test_ollama_generator_missing_content() {
    let upstream = Upstream::json(json!({"done": true})).await;
    let generator = OllamaGenerator::new(&upstream.base, "llama3.2", params(), transport(2_000, 0));
    assert!(matches!(
        generator.generate("PROMPT").await,
        Err(UpstreamFailure::Malformed(_))
    ));
}

// ============ Transport failures ============

#[tokio::test]
async fn test_server_errors_are_retried() {
    let upstream = Upstream::start(Duration::ZERO, |_, _| {
        (StatusCode::INTERNAL_SERVER_ERROR, "{\"error\":\"boom\"}".to_string())
    })
    .await;

    let embedder = OllamaEmbedder::new(&upstream.base, "m", transport(2_000, 2));
    let err = embedder.embed("hi").await.unwrap_err();
    assert!(matches!(err, UpstreamFailure::Transport(ref m) if m.contains("HTTP 500")));
    assert_eq!(upstream.requests().len(), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let upstream = Upstream::start(Duration::ZERO, |_, _| {
        (StatusCode::BAD_REQUEST, "{\"error\":\"bad input\"}".to_string())
    })
    .await;

    let embedder = OllamaEmbedder::new(&upstream.base, "m", transport(2_000, 2));
    let err = embedder.embed("hi").await.unwrap_err();
    assert!(matches!(err, UpstreamFailure::Transport(ref m) if m.contains("HTTP 400")));
    assert_eq!(upstream.requests().len(), 1);
}

#[tokio::test]
async fn test_invalid_json_is_malformed() {
    let upstream = Upstream::start(Duration::ZERO, |_, _| (StatusCode::OK, "<html>".to_string())).await;
    let embedder = OllamaEmbedder::new(&upstream.base, "m", transport(2_000, 0));
    assert!(matches!(
        embedder.embed("hi").await,
        Err(UpstreamFailure::Malformed(_))
    ));
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let upstream = Upstream::start(Duration::from_millis(1_500), |_, _| {
        (StatusCode::OK, json!({"embeddings": [[1.0]]}).to_string())
    })
    .await;

    let embedder = OllamaEmbedder::new(&upstream.base, "m", transport(100, 0));
    let err = embedder.embed("hi").await.unwrap_err();
    assert_eq!(err, UpstreamFailure::Timeout { after_ms: 100 });
}

#[tokio::test]
async fn test_unreachable_upstream_is_transport() {
    let embedder = OllamaEmbedder::new("http://127.0.0.1:9", "m", transport(1_000, 0));
    let err = embedder.embed("hi").await.unwrap_err();
    assert!(matches!(err, UpstreamFailure::Transport(_)));
}

// ============ Configured pipeline ============

#[tokio::test]
async fn test_configured_pipeline_with_ollama_and_memory_index() {
    let upstream = Upstream::start(Duration::ZERO, |path, _| match path {
        "/api/embed" => (StatusCode::OK, json!({"embeddings": [[1.0, 0.0]]}).to_string()),
        "/api/chat" => (
            StatusCode::OK,
            json!({"message": {"role": "assistant", "content": "Take CPSC 131 with Jane Doe [1]."}})
                .to_string(),
        ),
        _ => (StatusCode::NOT_FOUND, "{}".to_string()),
    })
    .await;

    let tmp = tempfile::TempDir::new().unwrap();
    let index_path = tmp.path().join("courses.ndjson");
    std::fs::write(
        &index_path,
        concat!(
            r#"{"id":"math150","values":[0.0,1.0],"metadata":{"Course":"MATH 150A"}}"#,
            "\n",
            r#"{"id":"cpsc131","values":[0.9,0.1],"metadata":{"Course":"CPSC 131","First Last":"Jane Doe"}}"#,
            "\n"
        ),
    )
    .unwrap();

    let mut config = Config::default();
    config.embedding.provider = "ollama".into();
    config.embedding.url = Some(upstream.base.clone());
    config.vector.provider = "memory".into();
    config.vector.path = Some(index_path);
    config.generation.provider = "ollama".into();
    config.generation.url = Some(upstream.base.clone());

    let pipeline = build_pipeline(&config).unwrap();
    let envelope = pipeline
        .answer(&QuestionRequest {
            question: "Who teaches data structures?".into(),
            top_k: 5,
        })
        .await
        .unwrap();

    assert_eq!(envelope.answer, "Take CPSC 131 with Jane Doe .");
    let ids: Vec<&str> = envelope.sources.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["cpsc131", "math150"]);

    let chat = upstream
        .requests()
        .into_iter()
        .find(|s| s.path == "/api/chat")
        .unwrap();
    let prompt = chat.body["messages"][0]["content"].as_str().unwrap();
    assert!(prompt.contains("Who teaches data structures?"));
    assert!(prompt.contains("CPSC 131"));
}

#[tokio::test]
async fn test_configured_pipeline_reports_failed_stage() {
    let upstream = Upstream::start(Duration::ZERO, |_, _| {
        (StatusCode::SERVICE_UNAVAILABLE, "{}".to_string())
    })
    .await;

    let mut config = Config::default();
    config.embedding.provider = "ollama".into();
    config.embedding.url = Some(upstream.base.clone());
    config.vector.provider = "memory".into();
    let tmp = tempfile::TempDir::new().unwrap();
    let index_path = tmp.path().join("empty.ndjson");
    std::fs::write(&index_path, "").unwrap();
    config.vector.path = Some(index_path);
    config.generation.provider = "ollama".into();
    config.generation.url = Some(upstream.base.clone());

    let pipeline = build_pipeline(&config).unwrap();
    let err = pipeline
        .answer(&QuestionRequest {
            question: "hi".into(),
            top_k: 3,
        })
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::Embedding);
    assert_eq!(err.message(), "Embedding failed");
}

#[tokio::test]
async fn test_configured_pipeline_retries_after_attempt_timeout() {
    // First embed call outlives the 1s attempt timeout; the retry answers.
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let app = Router::new().route(
        "/api/embed",
        post(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(1_500)).await;
                }
                Json(json!({"embeddings": [[1.0, 0.0]]}))
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let tmp = tempfile::TempDir::new().unwrap();
    let index_path = tmp.path().join("courses.ndjson");
    std::fs::write(
        &index_path,
        r#"{"id":"cpsc131","values":[0.9,0.1],"metadata":{"Course":"CPSC 131"}}"#,
    )
    .unwrap();

    let mut config = Config::default();
    config.embedding.provider = "ollama".into();
    config.embedding.url = Some(base.clone());
    config.embedding.timeout_secs = 1;
    config.embedding.max_retries = 2;
    config.vector.provider = "memory".into();
    config.vector.path = Some(index_path);
    config.generation.provider = "ollama".into();
    config.generation.url = Some(base);

    let pipeline = build_pipeline(&config).unwrap();
    let matches = pipeline.retrieve("data structures", 3).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id, "cpsc131");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

// ============ Workers KV ============

const KV_NAMESPACE: &str = "ns-1";

#[derive(Debug, Clone)]
struct KvWrite {
    key: String,
    ttl: Option<String>,
    auth: Option<String>,
}

#[derive(Clone, Default)]
struct MockKv {
    values: Arc<Mutex<HashMap<String, String>>>,
    writes: Arc<Mutex<Vec<KvWrite>>>,
    fail_reads: bool,
}

async fn kv_get(State(kv): State<MockKv>, Path(key): Path<String>) -> Response {
    if kv.fail_reads {
        return (StatusCode::INTERNAL_SERVER_ERROR, "{}").into_response();
    }
    match kv.values.lock().unwrap().get(&key) {
        Some(value) => (StatusCode::OK, value.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            json!({"success": false, "errors": [{"code": 10009, "message": "get: 'key not found'"}]})
                .to_string(),
        )
            .into_response(),
    }
}

async fn kv_put(
    State(kv): State<MockKv>,
    Path(key): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    kv.writes.lock().unwrap().push(KvWrite {
        key: key.clone(),
        ttl: query.get("expiration_ttl").cloned(),
        auth: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });
    kv.values.lock().unwrap().insert(key, body);
    Json(json!({"success": true, "errors": [], "result": null})).into_response()
}

impl MockKv {
    async fn start(fail_reads: bool) -> (Self, CloudflareApi) {
        let kv = MockKv {
            fail_reads,
            ..Default::default()
        };
        let route = format!(
            "/client/v4/accounts/{}/storage/kv/namespaces/{}/values/{{key}}",
            ACCOUNT, KV_NAMESPACE
        );
        let app = Router::new()
            .route(&route, axum::routing::get(kv_get).put(kv_put))
            .with_state(kv.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let api = CloudflareApi::new(format!("http://{}/client/v4", addr), ACCOUNT, TOKEN);
        (kv, api)
    }

    fn stored(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().unwrap();
        values.get(key).map(|raw| serde_json::from_str(raw).unwrap())
    }

    fn writes(&self) -> Vec<KvWrite> {
        self.writes.lock().unwrap().clone()
    }
}

fn kv_limiter(api: CloudflareApi, clock: Arc<ManualClock>) -> RateLimiter {
    let store = KvCounterStore::new(CloudflareKv::new(api, KV_NAMESPACE, transport(2_000, 0)));
    RateLimiter::new(Arc::new(store), clock, RateLimitPolicy::default())
}

#[tokio::test]
async fn test_kv_counter_store_limits_across_requests() {
    let (kv, api) = MockKv::start(false).await;
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let limiter = kv_limiter(api, clock.clone());

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        let decision = limiter.check("203.0.113.7").await.unwrap();
        outcomes.push((decision.allowed, decision.remaining));
    }
    assert_eq!(outcomes, vec![(true, 2), (true, 1), (true, 0), (false, 0)]);
    assert_eq!(
        kv.stored("rl:203.0.113.7"),
        Some(json!({"count": 4, "expires_at": 1_700_000_060}))
    );

    let writes = kv.writes();
    assert_eq!(writes.len(), 4);
    for write in &writes {
        assert_eq!(write.key, "rl:203.0.113.7");
        assert_eq!(write.ttl.as_deref(), Some("60"));
        assert_eq!(write.auth.as_deref(), Some("Bearer secret-token"));
    }

    // 30s left in the window; KV still gets its 60s minimum TTL.
    clock.advance(30);
    assert!(!limiter.check("203.0.113.7").await.unwrap().allowed);
    assert_eq!(kv.writes().last().unwrap().ttl.as_deref(), Some("60"));

    // Another client has its own counter.
    assert_eq!(limiter.check("198.51.100.2").await.unwrap().remaining, 2);

    // A fresh window once the stored one has expired.
    clock.advance(31);
    let decision = limiter.check("203.0.113.7").await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 2);
    assert_eq!(
        kv.stored("rl:203.0.113.7"),
        Some(json!({"count": 1, "expires_at": 1_700_000_121}))
    );
}

#[tokio::test]
async fn test_kv_read_failure_is_an_error() {
    let (kv, api) = MockKv::start(true).await;
    let limiter = kv_limiter(api, Arc::new(ManualClock::new(1_700_000_000)));

    let err = limiter.check("203.0.113.7").await.unwrap_err();
    assert!(err.to_string().contains("HTTP 500"), "{err}");
    assert!(kv.writes().is_empty());
}
