//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/query` | Answer a support question |
//! | `GET`  | `/health` | Health check (version, index readiness, circuit state) |
//! | `GET`  | `/v1/metrics` | JSON metrics summary, or Prometheus text with `?format=prometheus` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "rate limit exceeded, retry after 4.2s" } }
//! ```
//!
//! Status codes follow [`RagError::status_code`]; `429` and circuit-open
//! `503` responses carry a `Retry-After` header in whole seconds.
//!
//! # Correlation IDs
//!
//! A client-supplied `x-correlation-id` (or `x-request-id`) of at most 64
//! characters from `[A-Za-z0-9._-]` is reused; anything else is replaced by
//! a fresh 32-character hex id. Every response, errors and 404s included,
//! echoes the id in `x-correlation-id`.
//!
//! # Degraded Mode
//!
//! A missing or unreadable index does not stop the server. `/health` then
//! reports `status: "unavailable"` with `index_ready: false`, and every
//! query fails with `503 index_unavailable` carrying the load error.

use axum::{
    extract::{rejection::JsonRejection, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::answer::{AnswerParams, RequestContext, SupportEngine};
use crate::config::Config;
use crate::error::RagError;
use crate::models::AnswerPayload;
use crate::telemetry;
use metrics_exporter_prometheus::PrometheusHandle;

pub const CORRELATION_HEADER: &str = "x-correlation-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_CORRELATION_ID_LEN: usize = 64;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// `None` while the index could not be loaded.
    engine: Option<Arc<SupportEngine>>,
    index_error: Option<String>,
    request_timeout: Duration,
    privacy_mode: bool,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(engine: Arc<SupportEngine>, config: &Config) -> Self {
        Self {
            engine: Some(engine),
            index_error: None,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            privacy_mode: config.server.privacy_mode,
            metrics: telemetry::install(),
        }
    }

    /// State for a server whose index failed to load.
    pub fn unavailable(reason: impl Into<String>, config: &Config) -> Self {
        Self {
            engine: None,
            index_error: Some(reason.into()),
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            privacy_mode: config.server.privacy_mode,
            metrics: telemetry::install(),
        }
    }

    fn engine(&self) -> Result<&Arc<SupportEngine>, RagError> {
        self.engine.as_ref().ok_or_else(|| {
            RagError::IndexUnavailable(
                self.index_error
                    .clone()
                    .unwrap_or_else(|| "index not loaded".to_string()),
            )
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/query", post(handle_query))
        .route("/health", get(handle_health))
        .route("/v1/metrics", get(handle_metrics))
        .fallback(handle_not_found)
        .layer(middleware::from_fn(correlation_id))
        .layer(cors)
        .with_state(state)
}

/// Start the server on `[server].bind` and run until Ctrl-C.
///
/// On shutdown the query cache is persisted when `[cache].path` is set.
///
/// An unavailable index starts the server in degraded mode instead of
/// failing; any other startup error is returned.
pub async fn run_server(config: &Config, base_dir: &Path) -> anyhow::Result<()> {
    let state = match SupportEngine::from_config(config, base_dir).await {
        Ok(engine) => AppState::new(Arc::new(engine), config),
        Err(e) => match e.downcast::<RagError>() {
            Ok(RagError::IndexUnavailable(reason)) => {
                tracing::error!(reason = %reason, "index unavailable, serving in degraded mode");
                AppState::unavailable(reason, config)
            }
            Ok(other) => return Err(other.into()),
            Err(e) => return Err(e),
        },
    };
    let engine = state.engine.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("listening on http://{}", config.server.bind);
    tracing::info!(
        bind = %config.server.bind,
        chunks = engine.as_ref().map_or(0, |e| e.index().len()),
        index_ready = engine.is_some(),
        "server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    let cache = engine.as_ref().and_then(|e| e.cache());
    if let (Some(cache), Some(path)) = (cache, &config.cache.path) {
        let saved = cache.save(&base_dir.join(path))?;
        tracing::info!(entries = saved, "cache persisted");
    }
    Ok(())
}

// ============ Correlation middleware ============

fn is_valid_correlation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CORRELATION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Client id from the request headers, when acceptable.
pub fn correlation_from_headers(headers: &HeaderMap) -> Option<String> {
    [CORRELATION_HEADER, REQUEST_ID_HEADER]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| is_valid_correlation_id(v))
        .map(str::to_string)
}

async fn correlation_id(mut req: Request, next: Next) -> Response {
    let ctx = match correlation_from_headers(req.headers()) {
        Some(id) => RequestContext::new(id),
        None => RequestContext::generate(),
    };
    let id = ctx.correlation_id.clone().unwrap_or_default();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CORRELATION_HEADER), value);
    }
    response
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after: Option<Duration>,
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = err.status_code();
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        Self {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
            retry_after: err.retry_after(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(after) = self.retry_after {
            let secs = after.as_secs_f64().ceil().max(1.0) as u64;
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

async fn handle_not_found() -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: "no such route".to_string(),
        retry_after: None,
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    index_ready: bool,
    index_chunks: usize,
    circuit: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let response = match &state.engine {
        Some(engine) => HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            index_ready: true,
            index_chunks: engine.index().len(),
            circuit: engine.breaker().state().as_str(),
            error: None,
        },
        None => HealthResponse {
            status: "unavailable",
            version: env!("CARGO_PKG_VERSION"),
            index_ready: false,
            index_chunks: 0,
            circuit: "closed",
            error: state.index_error.clone(),
        },
    };
    Json(response)
}

// ============ GET /v1/metrics ============

#[derive(Debug, Default, Deserialize)]
struct MetricsQuery {
    format: Option<String>,
}

async fn handle_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Response, AppError> {
    let (ready, chunks) = match &state.engine {
        Some(engine) => {
            telemetry::set_circuit_state(engine.breaker().state());
            (true, engine.index().len())
        }
        None => (false, 0),
    };
    telemetry::set_index(ready, chunks);

    let exposition = match &state.metrics {
        Some(handle) => {
            handle.run_upkeep();
            handle.render()
        }
        None => String::new(),
    };

    match query.format.as_deref() {
        Some("prometheus") => Ok((
            [(header::CONTENT_TYPE, telemetry::PROMETHEUS_CONTENT_TYPE)],
            exposition,
        )
            .into_response()),
        None | Some("json") => {
            let mut body = telemetry::summarize(&exposition);
            let cache = state
                .engine
                .as_ref()
                .and_then(|e| e.cache())
                .map(|c| c.stats());
            body["app"] = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "index_ready": ready,
                "index_chunks": chunks,
                "circuit": state.engine.as_ref().map(|e| e.breaker().state().as_str()),
                "cache": cache,
                "recorder": state.metrics.is_some(),
            });
            Ok(Json(body).into_response())
        }
        Some(other) => Err(RagError::Validation(format!(
            "unknown metrics format '{}', expected json or prometheus",
            other
        ))
        .into()),
    }
}

// ============ POST /v1/query ============

#[derive(Debug, Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(flatten)]
    params: AnswerParams,
}

async fn handle_query(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<AnswerPayload>, AppError> {
    let engine = state.engine()?;
    let Json(req) = body.map_err(|e| AppError::from(RagError::Validation(e.body_text())))?;

    let mut payload = tokio::time::timeout(
        state.request_timeout,
        engine.answer(&ctx, &req.question, &req.params),
    )
    .await
    .map_err(|_| RagError::Timeout(state.request_timeout))??;

    if state.privacy_mode {
        payload.selected_chunks = payload.selected_chunks.iter().map(|s| s.redacted()).collect();
    }
    Ok(Json(payload))
}
