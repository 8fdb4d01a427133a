//! Append-only JSONL log of answered questions.
//!
//! Writes never fail a request: errors are reported with `tracing::warn!`
//! and dropped.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

use crate::config::QueryLogConfig;
use crate::models::{AnswerPayload, CacheStatus, Routing};

const MAX_QUESTION_CHARS: usize = 2000;
const MAX_ANSWER_CHARS: usize = 5000;
const MAX_CHUNK_CHARS: usize = 1000;

/// Drop control characters (newlines and tabs become spaces) and cap length.
pub fn sanitize_for_log(text: &str, max_chars: usize) -> String {
    let cleaned: String = text
        .chars()
        .filter_map(|c| match c {
            '\n' | '\r' | '\t' => Some(' '),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();

    if cleaned.chars().count() <= max_chars {
        cleaned
    } else {
        let mut out: String = cleaned.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
    question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<String>,
    chunk_ids: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks: Option<Vec<String>>,
    latency_ms: u64,
    refused: bool,
    confidence: Option<u8>,
    routing: Routing,
    cache_status: CacheStatus,
}

pub struct QueryLog {
    path: PathBuf,
    include_answer: bool,
    include_chunks: bool,
    lock: Mutex<()>,
}

impl QueryLog {
    /// `None` when logging is disabled.
    pub fn from_config(config: &QueryLogConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            path: config.path.clone(),
            include_answer: config.include_answer,
            include_chunks: config.include_chunks,
            lock: Mutex::new(()),
        })
    }

    /// Append one record. `chunk_texts` are the packed chunk bodies, used
    /// only when chunk logging is on.
    pub fn record(&self, question: &str, payload: &AnswerPayload, chunk_texts: &[&str]) {
        let record = LogRecord {
            timestamp: Utc::now().to_rfc3339(),
            correlation_id: payload.metadata.correlation_id.as_deref(),
            question: sanitize_for_log(question, MAX_QUESTION_CHARS),
            answer: self
                .include_answer
                .then(|| sanitize_for_log(&payload.answer, MAX_ANSWER_CHARS)),
            chunk_ids: &payload.packed_chunk_ids,
            chunks: self.include_chunks.then(|| {
                chunk_texts
                    .iter()
                    .map(|t| sanitize_for_log(t, MAX_CHUNK_CHARS))
                    .collect()
            }),
            latency_ms: payload.timing.total_ms,
            refused: payload.refused,
            confidence: payload.confidence,
            routing: payload.routing,
            cache_status: payload.metadata.cache_status,
        };

        if let Err(e) = self.append(&record) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write query log");
        }
    }

    fn append(&self, record: &LogRecord<'_>) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;

    fn payload() -> AnswerPayload {
        AnswerPayload {
            answer: "Use the\ttimer.\u{7}".into(),
            confidence: Some(82),
            reasoning: None,
            refused: false,
            refusal_reason: None,
            selected_chunks: vec![],
            packed_chunk_ids: vec!["c1".into(), "c2".into()],
            timing: Timing {
                retrieve_ms: 3,
                llm_ms: 40,
                total_ms: 45,
            },
            routing: Routing::for_answer(Some(82), false),
            metadata: AnswerMetadata {
                cache_status: CacheStatus::Miss,
                correlation_id: Some("abc".into()),
                retrieval_count: 5,
                packed_count: 2,
                tokens_used: 100,
                model: "m".into(),
                corrective_retry: false,
            },
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_for_log("a\nb\u{0}c", 100), "a bc");
        assert_eq!(sanitize_for_log("abcdef", 3), "abc...");
    }

    #[test]
    fn test_disabled_by_default() {
        assert!(QueryLog::from_config(&QueryLogConfig::default()).is_none());
    }

    #[test]
    fn test_appends_json_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = QueryLogConfig {
            enabled: true,
            path: tmp.path().join("logs/queries.jsonl"),
            include_answer: true,
            include_chunks: true,
        };
        let log = QueryLog::from_config(&config).unwrap();
        log.record("how\ndo I track?", &payload(), &["chunk one", "chunk two"]);
        log.record("second", &payload(), &[]);

        let body = std::fs::read_to_string(&config.path).unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["question"], "how do I track?");
        assert_eq!(lines[0]["answer"], "Use the timer.");
        assert_eq!(lines[0]["correlation_id"], "abc");
        assert_eq!(lines[0]["chunks"][1], "chunk two");
        assert_eq!(lines[0]["routing"]["action"], "self_serve");
        assert_eq!(lines[0]["cache_status"], "miss");
    }

    #[test]
    fn test_answer_omitted_when_configured() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = QueryLogConfig {
            enabled: true,
            path: tmp.path().join("q.jsonl"),
            include_answer: false,
            include_chunks: false,
        };
        QueryLog::from_config(&config)
            .unwrap()
            .record("q", &payload(), &["x"]);
        let line = std::fs::read_to_string(&config.path).unwrap();
        let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert!(v.get("answer").is_none());
        assert!(v.get("chunks").is_none());
    }

    #[test]
    fn test_unwritable_path_does_not_panic() {
        let config = QueryLogConfig {
            enabled: true,
            path: PathBuf::from("/proc/definitely/not/writable.jsonl"),
            include_answer: true,
            include_chunks: false,
        };
        QueryLog::from_config(&config)
            .unwrap()
            .record("q", &payload(), &[]);
    }
}
