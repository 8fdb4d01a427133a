mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

use common::{harness, test_config, Harness, ScriptedModel};
use support_rag::config::Config;
use support_rag::pack::{ApproxTokenizer, Tokenizer};
use support_rag::server::{build_router, AppState, CORRELATION_HEADER};
use support_rag::telemetry::PROMETHEUS_CONTENT_TYPE;

async fn router_with(config: &Config) -> (Router, Arc<ScriptedModel>) {
    let Harness { engine, model, .. } = harness(config, vec![]).await;
    let router = build_router(AppState::new(Arc::new(engine), config));
    (router, model)
}

fn query_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/query")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn degraded_router() -> Router {
    build_router(AppState::unavailable(
        "index directory not found: /srv/srag/index",
        &test_config(),
    ))
}

#[tokio::test]
async fn test_health() {
    let (router, _) = router_with(&test_config()).await;

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["index_ready"], true);
    assert_eq!(json["index_chunks"], 3);
    assert_eq!(json["circuit"], "closed");
    assert!(json.get("error").is_none());
}

#[tokio::test]
async fn test_health_reports_missing_index() {
    let response = degraded_router()
        .oneshot(get_request("/health"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "unavailable");
    assert_eq!(json["index_ready"], false);
    assert_eq!(json["index_chunks"], 0);
    assert!(json["error"].as_str().unwrap().contains("index directory not found"));
}

#[tokio::test]
async fn test_query_without_index_is_unavailable() {
    let response = degraded_router()
        .oneshot(query_request(r#"{"question": "How do I start a timer?"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(CORRELATION_HEADER));
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "index_unavailable");
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("/srv/srag/index"));
}

#[tokio::test]
async fn test_metrics_prometheus_text() {
    let (router, _) = router_with(&test_config()).await;
    let answered = router
        .clone()
        .oneshot(query_request(r#"{"question": "How do I start a timer?"}"#))
        .await
        .unwrap();
    assert_eq!(answered.status(), StatusCode::OK);

    let response = router
        .oneshot(get_request("/v1/metrics?format=prometheus"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], PROMETHEUS_CONTENT_TYPE);
    let text = body_text(response).await;
    for name in [
        "srag_queries_total",
        "srag_query_latency_seconds",
        "srag_cache_misses_total",
        "srag_circuit_state",
        "srag_index_ready",
    ] {
        assert!(text.contains(name), "missing {} in:\n{}", name, text);
    }
}

#[tokio::test]
async fn test_metrics_json_summary() {
    let (router, _) = router_with(&test_config()).await;
    let body = r#"{"question": "How do I start a timer?"}"#;
    for _ in 0..2 {
        let response = router.clone().oneshot(query_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router.oneshot(get_request("/v1/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    let counters = json["counters"].as_object().unwrap();
    assert!(counters.keys().any(|k| k.starts_with("srag_queries_total")));
    assert!(counters.keys().any(|k| k.starts_with("srag_cache_hits_total")));
    assert!(json["summary"]["count"].as_f64().unwrap() >= 2.0);
    assert_eq!(json["app"]["index_ready"], true);
    assert_eq!(json["app"]["index_chunks"], 3);
    assert_eq!(json["app"]["circuit"], "closed");
    assert_eq!(json["app"]["cache"]["hits"], 1);
}

#[tokio::test]
async fn test_metrics_while_degraded() {
    let response = degraded_router()
        .oneshot(get_request("/v1/metrics"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["app"]["index_ready"], false);
    assert!(json["app"]["circuit"].is_null());
}

#[tokio::test]
async fn test_metrics_unknown_format_rejected() {
    let response = degraded_router()
        .oneshot(get_request("/v1/metrics?format=xml"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
}

/// Counts tokens slowly on the blocking pool and records peak concurrency.
#[derive(Default)]
struct SlowTokenizer {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Tokenizer for SlowTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ApproxTokenizer.count_tokens(text)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_responsive_during_slow_retrieval() {
    let mut config = test_config();
    config.server.workers = 1;
    config.cache.enabled = false;
    let tokenizer = Arc::new(SlowTokenizer::default());
    let Harness { engine, .. } = harness(&config, vec![]).await;
    let engine = engine.with_tokenizer(tokenizer.clone());
    let router = build_router(AppState::new(Arc::new(engine), &config));

    let queries: Vec<_> = (0..4)
        .map(|_| {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .oneshot(query_request(r#"{"question": "How do I start a timer?"}"#))
                    .await
                    .unwrap()
                    .status()
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let started = Instant::now();
    let health = tokio::time::timeout(
        Duration::from_millis(250),
        router.clone().oneshot(get_request("/health")),
    )
    .await
    .expect("/health blocked behind retrieval")
    .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert!(started.elapsed() < Duration::from_millis(250));

    for query in queries {
        assert_eq!(query.await.unwrap(), StatusCode::OK);
    }
    assert!(tokenizer.calls.load(Ordering::SeqCst) >= 4);
    assert_eq!(tokenizer.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_query_echoes_correlation_id() {
    let (router, _) = router_with(&test_config()).await;

    let mut request = query_request(r#"{"question": "How do I start a timer?"}"#);
    request
        .headers_mut()
        .insert(CORRELATION_HEADER, "support-4711".parse().unwrap());
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CORRELATION_HEADER], "support-4711");
    let json = body_json(response).await;
    assert_eq!(json["refused"], false);
    assert_eq!(json["metadata"]["correlation_id"], "support-4711");
    assert_eq!(json["metadata"]["cache_status"], "miss");
    assert_eq!(json["routing"]["action"], "self_serve");
    assert_eq!(json["routing"]["level"], "green");
    assert_eq!(json["selected_chunks"][0]["title"], "Start a timer");
}

#[tokio::test]
async fn test_invalid_correlation_id_replaced() {
    let (router, _) = router_with(&test_config()).await;

    let mut request = query_request(r#"{"question": "How do I start a timer?"}"#);
    request
        .headers_mut()
        .insert(CORRELATION_HEADER, "not valid!".parse().unwrap());
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let id = response.headers()[CORRELATION_HEADER].to_str().unwrap().to_string();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    let json = body_json(response).await;
    assert_eq!(json["metadata"]["correlation_id"], id.as_str());
}

#[tokio::test]
async fn test_request_id_header_accepted() {
    let (router, _) = router_with(&test_config()).await;

    let mut request = query_request(r#"{"question": "How do I start a timer?"}"#);
    request
        .headers_mut()
        .insert("x-request-id", "upstream-9".parse().unwrap());
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.headers()[CORRELATION_HEADER], "upstream-9");
}

#[tokio::test]
async fn test_empty_question_is_bad_request() {
    let (router, model) = router_with(&test_config()).await;

    let response = router
        .oneshot(query_request(r#"{"question": "   "}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().contains_key(CORRELATION_HEADER));
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
    assert_eq!(json["error"]["message"], "Query cannot be empty");
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let (router, _) = router_with(&test_config()).await;

    let response = router
        .oneshot(query_request(r#"{"question": "#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let (router, _) = router_with(&test_config()).await;

    let request = Request::builder()
        .uri("/v2/nothing")
        .header(CORRELATION_HEADER, "trace-1")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[CORRELATION_HEADER], "trace-1");
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_rate_limited_response() {
    let mut config = test_config();
    config.rate_limit.enabled = true;
    config.rate_limit.max_requests = 1;
    config.rate_limit.window_secs = 30.0;
    let (router, _) = router_with(&config).await;

    let body = r#"{"question": "How do I start a timer?"}"#;
    let first = router.clone().oneshot(query_request(body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = router.clone().oneshot(query_request(body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers()[header::RETRY_AFTER], "30");
    let json = body_json(second).await;
    assert_eq!(json["error"]["code"], "rate_limited");
}

#[tokio::test]
async fn test_privacy_mode_redacts_sources() {
    let mut config = test_config();
    config.server.privacy_mode = true;
    let (router, _) = router_with(&config).await;

    let response = router
        .oneshot(query_request(r#"{"question": "How do I start a timer?"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let source = &json["selected_chunks"][0];
    assert_eq!(source["url"], "https://help.example.com/start-timer");
    assert!(source.get("title").map_or(true, Value::is_null));
}

#[tokio::test]
async fn test_per_request_params_validated() {
    let (router, _) = router_with(&test_config()).await;

    let response = router
        .oneshot(query_request(
            r#"{"question": "How do I start a timer?", "threshold": 2.0}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
