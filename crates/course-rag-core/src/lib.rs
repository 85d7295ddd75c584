//! # Course RAG Core
//!
//! Shared, runtime-free logic for the course question-answering service:
//! data models, input validation, CORS policy decisions, the fixed-window
//! rate limiter, context and prompt building, and the collaborator traits
//! the pipeline is written against.
//!
//! This crate contains no tokio, HTTP server, or network client
//! dependencies. Concrete embedding, vector-search, and generation
//! backends live in the `course-rag` app crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Question, match, source, and envelope types |
//! | [`validate`] | `/ask` body parsing and bounds checks |
//! | [`cors`] | Origin allow-list decisions and header sets |
//! | [`ratelimit`] | Fixed-window limiter and counter stores |
//! | [`clock`] | Wall-clock abstraction for deterministic tests |
//! | [`context`] | Context block, prompt, and citation stripping |
//! | [`upstream`] | Embedder / vector index / generator traits |

pub mod clock;
pub mod context;
pub mod cors;
pub mod models;
pub mod ratelimit;
pub mod upstream;
pub mod validate;
