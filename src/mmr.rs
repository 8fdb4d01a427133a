//! Maximal Marginal Relevance re-ranking.
//!
//! Picks, one at a time, the candidate maximizing
//! `λ·relevance − (1−λ)·max_sim(candidate, selected)`. Relevance is the
//! fused score; similarity is the dot product of unit embeddings. Ties go to
//! the candidate ranked earlier in the input.

use std::collections::HashSet;

use crate::models::ScoredCandidate;

/// Select up to `pack_top` diverse candidates.
///
/// `vector_of` maps a candidate's corpus index to its unit embedding.
/// Candidates repeating an already selected chunk id are dropped.
pub fn mmr_select<'a, F>(
    candidates: &[ScoredCandidate],
    vector_of: F,
    pack_top: usize,
    lambda: f32,
) -> Vec<ScoredCandidate>
where
    F: Fn(usize) -> &'a [f32],
{
    let mut seen = HashSet::new();
    let mut pool: Vec<&ScoredCandidate> = candidates
        .iter()
        .filter(|c| seen.insert(c.chunk_id.as_str()))
        .collect();

    let mut max_sim = vec![f32::NEG_INFINITY; pool.len()];
    let mut selected = Vec::with_capacity(pack_top.min(pool.len()));

    while selected.len() < pack_top && !pool.is_empty() {
        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for (i, cand) in pool.iter().enumerate() {
            let redundancy = if max_sim[i].is_finite() { max_sim[i] } else { 0.0 };
            let score = lambda * cand.fused_score - (1.0 - lambda) * redundancy;
            if score > best_score {
                best = i;
                best_score = score;
            }
        }

        let chosen = pool.remove(best);
        max_sim.remove(best);

        let chosen_vec = vector_of(chosen.index);
        for (i, cand) in pool.iter().enumerate() {
            let sim = crate::embedding::dot(vector_of(cand.index), chosen_vec);
            if sim > max_sim[i] {
                max_sim[i] = sim;
            }
        }
        selected.push(chosen.clone());
    }

    selected
}
