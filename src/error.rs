//! Unified error taxonomy for the answer pipeline.
//!
//! Each component owns a focused error enum ([`IngestError`],
//! [`AnswerContractError`], [`InferenceError`], [`CircuitOpenError`]);
//! [`RagError`] wraps them so the HTTP boundary can map every failure to a
//! status code without inspecting message text.
//!
//! | Variant | Code | HTTP |
//! |---------|------|------|
//! | `Validation` | `bad_request` | 400 |
//! | `Ingest` | `ingest_error` | 500 |
//! | `IndexUnavailable` | `index_unavailable` | 503 |
//! | `RateLimitExceeded` | `rate_limited` | 429 |
//! | `CircuitOpen` | `circuit_open` | 503 |
//! | `AnswerContract` | `answer_contract` | 502 |
//! | `Inference` | `inference_error` | 502 |
//! | `Embedding` | `embedding_error` | 502 |
//! | `Timeout` | `timeout` | 504 |
//! | `Internal` | `internal` | 500 |

use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::circuit::CircuitOpenError;
use crate::contract::AnswerContractError;
use crate::ingest::IngestError;
use crate::llm::InferenceError;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("rate limit exceeded, retry after {:.1}s", retry_after.as_secs_f64())]
    RateLimitExceeded { retry_after: Duration },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    AnswerContract(#[from] AnswerContractError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    /// Machine-readable error code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "bad_request",
            RagError::Ingest(_) => "ingest_error",
            RagError::IndexUnavailable(_) => "index_unavailable",
            RagError::RateLimitExceeded { .. } => "rate_limited",
            RagError::CircuitOpen(_) => "circuit_open",
            RagError::AnswerContract(_) => "answer_contract",
            RagError::Inference(_) => "inference_error",
            RagError::Embedding(_) => "embedding_error",
            RagError::Timeout(_) => "timeout",
            RagError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RagError::IndexUnavailable(_) | RagError::CircuitOpen(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RagError::AnswerContract(_) | RagError::Inference(_) | RagError::Embedding(_) => {
                StatusCode::BAD_GATEWAY
            }
            RagError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RagError::Ingest(_) | RagError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Delay the caller should wait before retrying, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RagError::RateLimitExceeded { retry_after } => Some(*retry_after),
            RagError::CircuitOpen(e) => Some(e.retry_after),
            _ => None,
        }
    }
}
