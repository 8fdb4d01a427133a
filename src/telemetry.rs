//! Prometheus metrics for the answer pipeline.
//!
//! Metrics go through the `metrics` facade into a process-wide Prometheus
//! recorder installed by [`install`]. Until a recorder is installed every
//! macro call is a no-op, so the CLI pays nothing for them.
//!
//! | Metric | Kind | Labels |
//! |--------|------|--------|
//! | `srag_queries_total` | counter | `outcome` |
//! | `srag_query_latency_seconds` | summary | |
//! | `srag_cache_hits_total` | counter | |
//! | `srag_cache_misses_total` | counter | |
//! | `srag_rate_limited_total` | counter | |
//! | `srag_circuit_state` | gauge | 0 closed, 1 half open, 2 open |
//! | `srag_index_ready` | gauge | |
//! | `srag_index_chunks` | gauge | |

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{json, Map, Value};
use std::sync::OnceLock;
use std::time::Duration;

use crate::circuit::CircuitState;
use crate::error::RagError;
use crate::models::AnswerPayload;

pub const QUERIES_TOTAL: &str = "srag_queries_total";
pub const QUERY_LATENCY: &str = "srag_query_latency_seconds";
pub const CACHE_HITS: &str = "srag_cache_hits_total";
pub const CACHE_MISSES: &str = "srag_cache_misses_total";
pub const RATE_LIMITED: &str = "srag_rate_limited_total";
pub const CIRCUIT_STATE: &str = "srag_circuit_state";
pub const INDEX_READY: &str = "srag_index_ready";
pub const INDEX_CHUNKS: &str = "srag_index_chunks";

/// Content type of the text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder once and return its handle.
///
/// Returns `None` when another recorder already owns the process.
pub fn install() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                describe();
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(error = %e, "metrics recorder not installed");
                None
            }
        })
        .clone()
}

fn describe() {
    describe_counter!(QUERIES_TOTAL, Unit::Count, "Answer requests by outcome");
    describe_histogram!(QUERY_LATENCY, Unit::Seconds, "End-to-end answer latency");
    describe_counter!(CACHE_HITS, Unit::Count, "Answers served from the query cache");
    describe_counter!(CACHE_MISSES, Unit::Count, "Cache lookups that missed");
    describe_counter!(RATE_LIMITED, Unit::Count, "Requests rejected by the rate limiter");
    describe_gauge!(CIRCUIT_STATE, "Model circuit: 0 closed, 1 half open, 2 open");
    describe_gauge!(INDEX_READY, "1 when the knowledge index is loaded");
    describe_gauge!(INDEX_CHUNKS, Unit::Count, "Chunks in the loaded index");
}

/// Outcome label for one finished answer request.
pub fn outcome(result: &Result<AnswerPayload, RagError>) -> &'static str {
    match result {
        Ok(payload) if payload.refused => "refused",
        Ok(_) => "answered",
        Err(e) => e.code(),
    }
}

pub fn record_query(result: &Result<AnswerPayload, RagError>, elapsed: Duration) {
    counter!(QUERIES_TOTAL, "outcome" => outcome(result)).increment(1);
    histogram!(QUERY_LATENCY).record(elapsed.as_secs_f64());
    if matches!(result, Err(RagError::RateLimitExceeded { .. })) {
        counter!(RATE_LIMITED).increment(1);
    }
}

pub fn record_cache(hit: bool) {
    if hit {
        counter!(CACHE_HITS).increment(1);
    } else {
        counter!(CACHE_MISSES).increment(1);
    }
}

pub fn set_circuit_state(state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!(CIRCUIT_STATE).set(value);
}

pub fn set_index(ready: bool, chunks: usize) {
    gauge!(INDEX_READY).set(if ready { 1.0 } else { 0.0 });
    gauge!(INDEX_CHUNKS).set(chunks as f64);
}

/// Group a text exposition into `counters`, `gauges` and the latency `summary`.
///
/// Series keys keep their label set, e.g. `srag_queries_total{outcome="answered"}`.
pub fn summarize(exposition: &str) -> Value {
    let mut counters = Map::new();
    let mut gauges = Map::new();
    let mut summary = Map::new();
    let mut quantiles = Map::new();

    for line in exposition.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((series, raw)) = line.rsplit_once(' ') else {
            continue;
        };
        let Ok(value) = raw.parse::<f64>() else {
            continue;
        };
        let (name, labels) = match series.split_once('{') {
            Some((name, rest)) => (name, rest.trim_end_matches('}')),
            None => (series, ""),
        };

        if name == QUERY_LATENCY {
            if let Some(q) = labels
                .strip_prefix("quantile=\"")
                .and_then(|q| q.strip_suffix('"'))
            {
                quantiles.insert(q.to_string(), json!(value));
            }
        } else if let Some(stat) = name
            .strip_prefix(QUERY_LATENCY)
            .and_then(|s| s.strip_prefix('_'))
        {
            summary.insert(stat.to_string(), json!(value));
        } else if name.ends_with("_total") {
            counters.insert(series.to_string(), json!(value));
        } else {
            gauges.insert(series.to_string(), json!(value));
        }
    }
    summary.insert("quantiles".to_string(), Value::Object(quantiles));

    json!({
        "counters": counters,
        "gauges": gauges,
        "summary": summary,
    })
}
