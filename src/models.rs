//! Core data types flowing through ingestion, retrieval and answering.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A retrievable unit of knowledge. Immutable once the index is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub article_id: String,
    pub title: String,
    /// Chunks sharing a URL belong to one article.
    pub url: String,
    pub section: String,
    /// Body prefixed with a `Context: <title>` header.
    pub text: String,
    pub doc_path: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Chunk {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            id: self.id.clone(),
            title: Some(self.title.clone()),
            section: Some(self.section.clone()),
            url: self.url.clone(),
        }
    }
}

/// Per-query scores for one chunk. `index` is the chunk's corpus position.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub index: usize,
    pub chunk_id: String,
    pub lexical_score: f32,
    pub dense_score: f32,
    pub fused_score: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackedContext {
    pub chunk_ids: Vec<String>,
    /// Corpus positions, parallel to `chunk_ids`.
    pub indices: Vec<usize>,
    pub text: String,
    pub tokens_used: usize,
}

impl PackedContext {
    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }
}

/// A cited source as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub url: String,
}

impl SourceRef {
    pub fn redacted(&self) -> Self {
        Self {
            id: self.id.clone(),
            title: None,
            section: None,
            url: self.url.clone(),
        }
    }
}

/// A selected-chunk reference parsed from a model citation.
///
/// Citations are either 1-based block numbers or chunk ids. Both are
/// resolved to a [`SourceRef`] exactly once, right after the model replies.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkRef {
    /// 1-based `[CONTEXT_BLOCK id=N]` number from the packed context.
    Block(usize),
    Id(String),
}

impl ChunkRef {
    /// Interpret a `sources_used` entry from the model.
    pub fn from_citation(citation: &str, packed_len: usize) -> Self {
        let trimmed = citation
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim();
        match trimmed.parse::<usize>() {
            Ok(n) if (1..=packed_len).contains(&n) => ChunkRef::Block(n),
            _ => ChunkRef::Id(trimmed.to_string()),
        }
    }

    /// Resolve against the corpus and the packed context of this request.
    pub fn resolve(&self, chunks: &[Chunk], packed: &PackedContext) -> Option<SourceRef> {
        match self {
            ChunkRef::Block(n) => packed
                .indices
                .get(n.checked_sub(1)?)
                .and_then(|i| chunks.get(*i))
                .map(Chunk::source_ref),
            ChunkRef::Id(chunk_id) => chunks
                .iter()
                .find(|c| &c.id == chunk_id)
                .map(Chunk::source_ref),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAction {
    SelfServe,
    Review,
    Escalate,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteAction::SelfServe => "self_serve",
            RouteAction::Review => "review",
            RouteAction::Escalate => "escalate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub action: RouteAction,
    pub level: ConfidenceLevel,
}

impl Routing {
    /// Route by confidence: ≥75 self-serve, ≥40 human review, else escalate.
    pub fn for_answer(confidence: Option<u8>, refused: bool) -> Self {
        match (refused, confidence) {
            (false, Some(c)) if c >= 75 => Self {
                action: RouteAction::SelfServe,
                level: ConfidenceLevel::Green,
            },
            (false, Some(c)) if c >= 40 => Self {
                action: RouteAction::Review,
                level: ConfidenceLevel::Yellow,
            },
            _ => Self {
                action: RouteAction::Escalate,
                level: ConfidenceLevel::Red,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub retrieve_ms: u64,
    pub llm_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    Disabled,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerMetadata {
    pub cache_status: CacheStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub retrieval_count: usize,
    pub packed_count: usize,
    pub tokens_used: usize,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub corrective_retry: bool,
}

/// Full answer as returned to callers and stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub answer: String,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub reasoning: Option<String>,
    pub refused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal_reason: Option<String>,
    pub selected_chunks: Vec<SourceRef>,
    pub packed_chunk_ids: Vec<String>,
    pub timing: Timing,
    pub routing: Routing,
    pub metadata: AnswerMetadata,
}
