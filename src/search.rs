//! Hybrid retrieval: BM25 + dense scoring, fusion, MMR and packing.
//!
//! # Scoring
//!
//! Every chunk gets a raw BM25 score for the (expanded) lexical query and a
//! raw cosine similarity for the query embedding. Each channel is min-max
//! normalized to `[0, 1]` over the corpus and fused:
//!
//! ```text
//! fused = alpha · lexical_norm + (1 − alpha) · dense_norm
//! ```
//!
//! The top `top_k` by fused score (ties to the lower corpus position) go to
//! MMR, whose picks are packed into the context budget.
//!
//! Candidates keep their raw channel scores; the coverage gate compares the
//! raw dense similarity against `threshold`.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{self, dot, EmbeddingProvider};
use crate::expand::QueryExpander;
use crate::index::KnowledgeIndex;
use crate::mmr::mmr_select;
use crate::models::{PackedContext, ScoredCandidate};
use crate::pack::{pack, PackOptions, Tokenizer};

/// Effective retrieval knobs for one request; part of the cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub pack_top: usize,
    pub alpha: f32,
    pub mmr_lambda: f32,
    pub threshold: f32,
    pub budget_tokens: usize,
    pub max_chunks_per_article: usize,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl RetrievalParams {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            pack_top: config.pack_top,
            alpha: config.alpha,
            mmr_lambda: config.mmr_lambda,
            threshold: config.threshold,
            budget_tokens: config.context_budget_tokens,
            max_chunks_per_article: config.max_chunks_per_article,
            bm25_k1: config.bm25_k1,
            bm25_b: config.bm25_b,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    /// Fused top-k, best first.
    pub candidates: Vec<ScoredCandidate>,
    /// MMR order.
    pub selected: Vec<ScoredCandidate>,
    pub packed: PackedContext,
    /// Highest raw dense similarity among the candidates.
    pub best_dense: Option<f32>,
}

impl Retrieval {
    /// Whether the retrieved context is strong enough to answer from.
    pub fn covers(&self, threshold: f32) -> bool {
        !self.packed.is_empty() && self.best_dense.is_some_and(|d| d >= threshold)
    }
}

/// Min-max normalize to `[0, 1]`. All-equal inputs map to 1.0.
pub fn normalize_scores(raw: &[f32]) -> Vec<f32> {
    if raw.is_empty() {
        return Vec::new();
    }

    let s_min = raw.iter().copied().fold(f32::INFINITY, f32::min);
    let s_max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    raw.iter()
        .map(|s| {
            if (s_max - s_min).abs() < f32::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Fuse both channels and keep the `top_k` best.
///
/// `lexical[i]`, `dense[i]` and `chunk_ids[i]` describe corpus position `i`.
pub fn hybrid_rank(
    lexical: &[f32],
    dense: &[f32],
    chunk_ids: &[&str],
    alpha: f32,
    top_k: usize,
) -> Vec<ScoredCandidate> {
    let lex_norm = normalize_scores(lexical);
    let dense_norm = normalize_scores(dense);

    let mut ranked: Vec<ScoredCandidate> = chunk_ids
        .iter()
        .enumerate()
        .map(|(i, id)| ScoredCandidate {
            index: i,
            chunk_id: id.to_string(),
            lexical_score: lexical[i],
            dense_score: dense[i],
            fused_score: alpha * lex_norm[i] + (1.0 - alpha) * dense_norm[i],
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then(a.index.cmp(&b.index))
    });
    ranked.truncate(top_k);
    ranked
}

/// Score, diversify and pack. CPU-bound; callers on the async runtime run it
/// through `spawn_blocking`.
pub fn retrieve(
    index: &KnowledgeIndex,
    lexical_query: &str,
    query_vec: &[f32],
    params: &RetrievalParams,
    tokenizer: &dyn Tokenizer,
) -> Retrieval {
    if index.is_empty() {
        return Retrieval::default();
    }

    let lexical = index.lexical().scores(lexical_query);
    let dense: Vec<f32> = (0..index.len())
        .map(|i| dot(query_vec, index.embedding(i)))
        .collect();
    let ids: Vec<&str> = index.chunks().iter().map(|c| c.id.as_str()).collect();

    let candidates = hybrid_rank(&lexical, &dense, &ids, params.alpha, params.top_k);
    let best_dense = candidates
        .iter()
        .map(|c| c.dense_score)
        .max_by(|a, b| a.total_cmp(b));

    let selected = mmr_select(
        &candidates,
        |i| index.embedding(i),
        params.pack_top,
        params.mmr_lambda,
    );
    let packed = pack(
        &selected,
        index.chunks(),
        tokenizer,
        PackOptions {
            budget: params.budget_tokens,
            max_chunks_per_article: params.max_chunks_per_article,
        },
    );

    tracing::debug!(
        candidates = candidates.len(),
        selected = selected.len(),
        packed = packed.chunk_ids.len(),
        tokens = packed.tokens_used,
        best_dense = ?best_dense,
        "retrieval complete"
    );

    Retrieval {
        candidates,
        selected,
        packed,
        best_dense,
    }
}

/// `srag search`: print the packed retrieval result for a query.
pub async fn run_search(config: &Config, config_dir: &Path, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let mut index = KnowledgeIndex::load(&config_dir.join(&config.index.dir))?;
    index.set_bm25_params(config.retrieval.bm25_k1, config.retrieval.bm25_b);
    let provider = embedding::create_provider(&config.embedding)?;
    let expander = QueryExpander::from_config(&config.retrieval)?;

    let mut params = RetrievalParams::from_config(&config.retrieval);
    if let Some(limit) = limit {
        params.pack_top = limit.max(1);
    }

    let lexical_query = match &expander {
        Some(e) => e.expand(query),
        None => query.to_string(),
    };
    let query_vec = embedding::embed_query(provider.as_ref(), query).await?;
    let retrieval = retrieve(
        &index,
        &lexical_query,
        &query_vec,
        &params,
        &crate::pack::ApproxTokenizer,
    );

    if retrieval.packed.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (rank, &i) in retrieval.packed.indices.iter().enumerate() {
        let chunk = &index.chunks()[i];
        let score = retrieval
            .selected
            .iter()
            .find(|c| c.index == i)
            .map(|c| c.fused_score)
            .unwrap_or_default();
        let excerpt: String = chunk
            .text
            .lines()
            .skip_while(|l| l.starts_with("Context:") || l.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let excerpt: String = excerpt.chars().take(240).collect();

        println!("{}. [{:.2}] {} / {}", rank + 1, score, chunk.title, chunk.section);
        println!("    url: {}", chunk.url);
        println!("    excerpt: \"{}\"", excerpt.trim());
        println!("    id: {}", chunk.id);
        println!();
    }
    println!(
        "{} chunks, {} tokens, best similarity {:.3}",
        retrieval.packed.chunk_ids.len(),
        retrieval.packed.tokens_used,
        retrieval.best_dense.unwrap_or_default()
    );

    Ok(())
}

// ============ Fusion tests ============
