//! # Course RAG
//!
//! Retrieval-augmented question answering over a university course
//! catalogue.
//!
//! A question arrives over HTTP, passes the CORS guard, the per-client rate
//! limiter, and input validation, is embedded, matched against a vector
//! index of course records, and answered by a text-generation model from
//! the retrieved context. The answer comes back with a structured list of
//! the courses it was drawn from.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐  ┌──────┐  ┌────────────┐  ┌──────────┐  ┌───────────────────┐
//! │ Router │─▶│ CORS │─▶│ Rate limit │─▶│ Validate │─▶│ Pipeline          │
//! └────────┘  └──────┘  └────────────┘  └──────────┘  │ embed → search →  │
//!                                                     │ context → generate│
//!                                                     └───────────────────┘
//! ```
//!
//! Pure logic (models, validation, CORS decisions, rate limiting, prompt
//! building) lives in the `course-rag-core` crate; this crate holds the
//! I/O side.
//!
//! ## Quick Start
//!
//! ```bash
//! course-rag serve                              # start HTTP server
//! course-rag ask "Who teaches CPSC 131?"        # one-shot answer
//! course-rag query "data structures" --top-k 3  # retrieval only
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, env overrides, validation |
//! | [`http`] | JSON transport with timeouts and retry |
//! | [`cloudflare`] | Cloudflare REST endpoints and envelope |
//! | [`embedding`] | Embedding backends |
//! | [`vector_index`] | Vector-search backends |
//! | [`llm`] | Text-generation backends |
//! | [`retrieval`] | Deadline-bounded embed + search client |
//! | [`generation`] | Prompting and answer cleanup |
//! | [`pipeline`] | Stage-by-stage orchestration |
//! | [`identity`] | Client identity for rate limiting |
//! | [`counter_store`] | Rate-limit counter backends (memory, Workers KV) |
//! | [`error`] | HTTP error taxonomy |
//! | [`middleware`] | CORS guard and rate limiter layers |
//! | [`server`] | axum router and server lifecycle |
//! | [`ask_cmd`] | `ask` / `query` CLI commands |

pub mod ask_cmd;
pub mod cloudflare;
pub mod config;
pub mod counter_store;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod http;
pub mod identity;
pub mod llm;
pub mod middleware;
pub mod pipeline;
pub mod retrieval;
pub mod server;
pub mod vector_index;
