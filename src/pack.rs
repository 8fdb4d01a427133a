//! Token-budgeted context packing.
//!
//! Chunks are taken in the diversified order and rendered as numbered
//! blocks the model can cite:
//!
//! ```text
//! [CONTEXT_BLOCK id=1]
//! source: https://help.example.com/lock-timesheets
//! Context: Lock timesheets > Key points
//!
//! Locked entries can only be edited by admins.
//! ```
//!
//! A block that alone exceeds the budget is left out; the first block that
//! would overflow the running total ends packing. `tokens_used` never
//! exceeds the budget.

use std::collections::HashMap;

use crate::chunk::CHARS_PER_TOKEN;
use crate::models::{Chunk, PackedContext, ScoredCandidate};

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Character-ratio estimate: `ceil(chars / 4)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenizer;

impl Tokenizer for ApproxTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PackOptions {
    pub budget: usize,
    /// Maximum blocks from one article (by URL); 0 disables the cap.
    pub max_chunks_per_article: usize,
}

pub fn render_block(number: usize, chunk: &Chunk) -> String {
    let mut block = format!("[CONTEXT_BLOCK id={}]\n", number);
    if !chunk.url.is_empty() {
        block.push_str(&format!("source: {}\n", chunk.url));
    }
    block.push_str(chunk.text.trim());
    block.push_str("\n\n");
    block
}

pub fn pack(
    selected: &[ScoredCandidate],
    chunks: &[Chunk],
    tokenizer: &dyn Tokenizer,
    options: PackOptions,
) -> PackedContext {
    let mut packed = PackedContext::default();
    let mut per_article: HashMap<&str, usize> = HashMap::new();

    for cand in selected {
        let Some(chunk) = chunks.get(cand.index) else {
            continue;
        };

        if options.max_chunks_per_article > 0
            && per_article.get(chunk.url.as_str()).copied().unwrap_or(0)
                >= options.max_chunks_per_article
        {
            continue;
        }

        let block = render_block(packed.chunk_ids.len() + 1, chunk);
        let tokens = tokenizer.count_tokens(&block);

        if tokens > options.budget {
            tracing::debug!(chunk = %chunk.id, tokens, budget = options.budget, "chunk exceeds budget alone");
            continue;
        }
        if packed.tokens_used + tokens > options.budget {
            break;
        }

        packed.text.push_str(&block);
        packed.tokens_used += tokens;
        packed.chunk_ids.push(chunk.id.clone());
        packed.indices.push(cand.index);
        *per_article.entry(chunk.url.as_str()).or_insert(0) += 1;
    }

    let trimmed_len = packed.text.trim_end().len();
    packed.text.truncate(trimmed_len);
    packed
}
