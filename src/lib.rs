//! # Support RAG
//!
//! Retrieval-augmented answers for an internal support desk.
//!
//! A markdown help corpus is chunked and indexed twice (BM25 postings and a
//! unit-vector embedding matrix). Each question is scored by both, fused,
//! diversified with MMR and packed into a token budget; a local model then
//! answers in a strict JSON contract, which is validated before the answer
//! is routed by confidence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────────────┐
//! │  Corpus  │──▶│ Ingest+Chunk │──▶│ Index (BM25 + dense) │
//! │ markdown │   │   + Embed    │   │   on-disk artifacts  │
//! └──────────┘   └──────────────┘   └──────────┬───────────┘
//!                                              │
//!             ┌────────────────────────────────┤
//!             ▼                                ▼
//!   ┌───────────────────┐   ┌─────────────────────────────────────────┐
//!   │ CLI (srag ask /   │──▶│ SupportEngine: limiter → cache → fuse → │
//!   │ search / serve)   │   │ MMR → pack → breaker → model → contract │
//!   └───────────────────┘   └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Unified error type and HTTP mapping |
//! | [`models`] | Core data types |
//! | [`ingest`] | Corpus scanning and front matter parsing |
//! | [`chunk`] | Section windowing |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`lexical`] | BM25 index |
//! | [`index`] | Persisted index artifacts |
//! | [`expand`] | Query expansion |
//! | [`search`] | Hybrid scoring and retrieval |
//! | [`mmr`] | Diversity selection |
//! | [`pack`] | Token-budget packing |
//! | [`cache`] | TTL query cache |
//! | [`rate_limit`] | Sliding-window rate limiter |
//! | [`circuit`] | Circuit breaker |
//! | [`clock`] | Injectable monotonic clock |
//! | [`contract`] | Answer contract validation |
//! | [`llm`] | Chat model client |
//! | [`prompt`] | Prompt assembly |
//! | [`query_log`] | JSONL query audit log |
//! | [`answer`] | The answer pipeline |
//! | [`telemetry`] | Prometheus metrics |
//! | [`server`] | HTTP API |

pub mod answer;
pub mod cache;
pub mod chunk;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod contract;
pub mod embedding;
pub mod error;
pub mod expand;
pub mod index;
pub mod ingest;
pub mod lexical;
pub mod llm;
pub mod mmr;
pub mod models;
pub mod pack;
pub mod prompt;
pub mod query_log;
pub mod rate_limit;
pub mod search;
pub mod server;
pub mod telemetry;
