//! Shared fixtures: a small in-memory corpus, a keyword embedder and a
//! scripted chat model.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use support_rag::answer::SupportEngine;
use support_rag::clock::ManualClock;
use support_rag::config::Config;
use support_rag::embedding::EmbeddingProvider;
use support_rag::error::Result;
use support_rag::index::KnowledgeIndex;
use support_rag::llm::{ChatMessage, InferenceError, InferenceInvoker};
use support_rag::models::Chunk;

const KEYWORDS: [&str; 4] = ["timer", "invoice", "kiosk", "lock"];

/// One dimension per keyword; text with none of them embeds to zero.
pub struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    fn dims(&self) -> usize {
        KEYWORDS.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }
}

fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    KEYWORDS
        .iter()
        .map(|kw| words.iter().filter(|w| w.starts_with(kw)).count() as f32)
        .collect()
}

/// Chat model that replays queued replies and counts calls.
///
/// Once the queue is drained every call returns [`good_reply`].
pub struct ScriptedModel {
    replies: Mutex<VecDeque<std::result::Result<String, InferenceError>>>,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<ChatMessage>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<std::result::Result<String, InferenceError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: std::result::Result<String, InferenceError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last_messages.lock().clone()
    }
}

#[async_trait]
impl InferenceInvoker for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted-test"
    }

    async fn invoke(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
    ) -> std::result::Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock() = messages.to_vec();
        let next = self.replies.lock().pop_front();
        next.unwrap_or_else(|| Ok(good_reply(85, &["1"])))
    }
}

pub fn good_reply(confidence: u8, sources: &[&str]) -> String {
    serde_json::json!({
        "answer": "Click Start in the Time Tracker to begin the timer.",
        "confidence": confidence,
        "reasoning": "Block 1 describes starting the timer.",
        "sources_used": sources,
    })
    .to_string()
}

pub fn server_error() -> std::result::Result<String, InferenceError> {
    Err(InferenceError::Status {
        status: 500,
        body: "model crashed".to_string(),
    })
}

fn chunk(id: &str, title: &str, url: &str, body: &str) -> Chunk {
    Chunk {
        id: id.to_string(),
        article_id: id.split('#').next().unwrap_or(id).to_string(),
        title: title.to_string(),
        url: url.to_string(),
        section: title.to_string(),
        text: format!("Context: {}\n\n{}", title, body),
        doc_path: "kb/test.md".to_string(),
        metadata: BTreeMap::new(),
    }
}

pub fn corpus() -> Vec<Chunk> {
    vec![
        chunk(
            "start-timer#0",
            "Start a timer",
            "https://help.example.com/start-timer",
            "Click Start in the Time Tracker to begin the timer. The timer keeps running in the background.",
        ),
        chunk(
            "invoice#0",
            "Create an invoice",
            "https://help.example.com/invoice",
            "Open Invoices and choose New invoice to bill a client for tracked time.",
        ),
        chunk(
            "kiosk#0",
            "Kiosk mode",
            "https://help.example.com/kiosk",
            "Kiosk mode lets employees clock in from a shared device with a PIN.",
        ),
    ]
}

/// Config with the cache on, rate limiting off and a low breaker threshold.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.query_log.enabled = false;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.recovery_secs = 30.0;
    config
}

pub async fn test_index() -> Arc<KnowledgeIndex> {
    let index = KnowledgeIndex::build(corpus(), &KeywordEmbedder, 8, 1.2, 0.65)
        .await
        .unwrap();
    Arc::new(index)
}

pub struct Harness {
    pub engine: SupportEngine,
    pub model: Arc<ScriptedModel>,
    pub clock: Arc<ManualClock>,
}

pub async fn harness(
    config: &Config,
    replies: Vec<std::result::Result<String, InferenceError>>,
) -> Harness {
    let model = ScriptedModel::new(replies);
    let clock = Arc::new(ManualClock::new());
    let engine = SupportEngine::new(
        config,
        test_index().await,
        Arc::new(KeywordEmbedder),
        model.clone(),
        clock.clone(),
    )
    .unwrap();
    Harness {
        engine,
        model,
        clock,
    }
}
