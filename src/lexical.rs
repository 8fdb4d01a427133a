//! BM25 postings index over chunk texts.
//!
//! ```text
//! score(q, d) = Σ idf(t) · tf(t,d)·(k1+1) / (tf(t,d) + k1·(1 − b + b·|d|/avgdl))
//! idf(t)      = ln(1 + (N − df(t) + 0.5) / (df(t) + 0.5))
//! ```
//!
//! The index is serializable so it can be persisted next to the embedding
//! matrix and reloaded without re-tokenizing the corpus.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Lowercased alphanumeric terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalIndex {
    k1: f32,
    b: f32,
    doc_lens: Vec<u32>,
    avgdl: f32,
    /// term → [(doc, term frequency)] in ascending doc order
    postings: BTreeMap<String, Vec<(u32, u32)>>,
}

impl LexicalIndex {
    pub fn build<'a, I>(texts: I, k1: f32, b: f32) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut doc_lens = Vec::new();
        let mut postings: BTreeMap<String, Vec<(u32, u32)>> = BTreeMap::new();

        for (doc, text) in texts.into_iter().enumerate() {
            let terms = tokenize(text);
            doc_lens.push(terms.len() as u32);

            let mut tf: HashMap<String, u32> = HashMap::new();
            for term in terms {
                *tf.entry(term).or_insert(0) += 1;
            }
            for (term, count) in tf {
                postings.entry(term).or_default().push((doc as u32, count));
            }
        }

        for list in postings.values_mut() {
            list.sort_unstable_by_key(|(doc, _)| *doc);
        }

        let total: u64 = doc_lens.iter().map(|l| *l as u64).sum();
        let avgdl = if doc_lens.is_empty() {
            0.0
        } else {
            total as f32 / doc_lens.len() as f32
        };

        Self {
            k1,
            b,
            doc_lens,
            avgdl,
            postings,
        }
    }

    /// Override the BM25 constants of a loaded snapshot.
    pub fn set_params(&mut self, k1: f32, b: f32) {
        self.k1 = k1;
        self.b = b;
    }

    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.postings.len()
    }

    fn idf(&self, df: usize) -> f32 {
        let n = self.doc_lens.len() as f32;
        let df = df as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// BM25 score of every document, indexed by corpus position.
    ///
    /// Repeated query terms count once.
    pub fn scores(&self, query: &str) -> Vec<f32> {
        let mut scores = vec![0.0f32; self.doc_lens.len()];
        if self.avgdl <= 0.0 {
            return scores;
        }

        let mut seen = HashSet::new();
        for term in tokenize(query) {
            if !seen.insert(term.clone()) {
                continue;
            }
            let Some(list) = self.postings.get(&term) else {
                continue;
            };
            let idf = self.idf(list.len());
            for &(doc, tf) in list {
                let tf = tf as f32;
                let len_norm = 1.0 - self.b + self.b * self.doc_lens[doc as usize] as f32 / self.avgdl;
                scores[doc as usize] += idf * tf * (self.k1 + 1.0) / (tf + self.k1 * len_norm);
            }
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(docs: &[&str]) -> LexicalIndex {
        LexicalIndex::build(docs.iter().copied(), 1.2, 0.65)
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("How to TRACK time? (SSO-login)"),
            vec!["how", "to", "track", "time", "sso", "login"]
        );
    }

    #[test]
    fn test_matching_doc_ranks_first() {
        let idx = index(&[
            "invoices and billing for clients",
            "track time with the timer button",
            "export a summary report",
        ]);
        let scores = idx.scores("how do I track time");
        assert!(scores[1] > scores[0]);
        assert!(scores[1] > scores[2]);
        assert_eq!(scores[0], 0.0);
    }

    #[test]
    fn test_rare_terms_weigh_more() {
        let idx = index(&[
            "time time entry",
            "time approvals",
            "time kiosk",
            "time kiosk pin",
        ]);
        let s = idx.scores("time pin");
        // "pin" appears once in the corpus, "time" everywhere
        assert!(s[3] > s[0]);
    }

    #[test]
    fn test_length_normalization() {
        let idx = index(&[
            "timer",
            "timer plus many other unrelated words about projects clients and tags",
        ]);
        let s = idx.scores("timer");
        assert!(s[0] > s[1]);
    }

    #[test]
    fn test_repeated_query_terms_count_once() {
        let idx = index(&["timer button", "report"]);
        assert_eq!(idx.scores("timer"), idx.scores("timer timer timer"));
    }

    #[test]
    fn test_empty_index_and_query() {
        let idx = index(&[]);
        assert!(idx.scores("anything").is_empty());
        let idx = index(&["a b c"]);
        assert_eq!(idx.scores(""), vec![0.0]);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_scores() {
        let idx = index(&["lock timesheets", "approve timesheets weekly"]);
        let json = serde_json::to_string(&idx).unwrap();
        let restored: LexicalIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(idx.scores("timesheets"), restored.scores("timesheets"));
    }
}
