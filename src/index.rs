//! Persisted knowledge index: chunks, embedding matrix and BM25 postings.
//!
//! # On-disk layout
//!
//! ```text
//! <index.dir>/
//!   chunks.jsonl     one Chunk per line, corpus order
//!   embeddings.f32   row-major little-endian f32, chunk_count × dims
//!   lexical.json     serialized LexicalIndex
//!   manifest.json    version, counts, dims, model, built_at
//! ```
//!
//! `manifest.json` is written last, so a directory without one is treated
//! as an interrupted build.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::embedding::{blob_to_vec, embed_all, vec_to_blob, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::lexical::LexicalIndex;
use crate::models::Chunk;

pub const INDEX_FORMAT_VERSION: u32 = 1;

const CHUNKS_FILE: &str = "chunks.jsonl";
const EMBEDDINGS_FILE: &str = "embeddings.f32";
const LEXICAL_FILE: &str = "lexical.json";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub chunk_count: usize,
    pub dims: usize,
    pub embedding_model: String,
    pub built_at: DateTime<Utc>,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

pub struct KnowledgeIndex {
    chunks: Vec<Chunk>,
    /// Flat `chunk_count × dims` matrix of unit vectors.
    vectors: Vec<f32>,
    dims: usize,
    lexical: LexicalIndex,
    manifest: Manifest,
}

impl KnowledgeIndex {
    /// Embed every chunk and build both retrieval indices.
    pub async fn build(
        chunks: Vec<Chunk>,
        provider: &dyn EmbeddingProvider,
        batch_size: usize,
        k1: f32,
        b: f32,
    ) -> Result<Self> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded = embed_all(provider, &texts, batch_size).await?;
        let vectors: Vec<f32> = embedded.into_iter().flatten().collect();

        let manifest = Manifest {
            version: INDEX_FORMAT_VERSION,
            chunk_count: chunks.len(),
            dims: provider.dims(),
            embedding_model: provider.model_name().to_string(),
            built_at: Utc::now(),
            bm25_k1: k1,
            bm25_b: b,
        };
        Self::from_parts(chunks, vectors, manifest)
    }

    /// Assemble an index from precomputed vectors, building the lexical side.
    pub fn from_parts(chunks: Vec<Chunk>, vectors: Vec<f32>, manifest: Manifest) -> Result<Self> {
        let lexical = LexicalIndex::build(
            chunks.iter().map(|c| c.text.as_str()),
            manifest.bm25_k1,
            manifest.bm25_b,
        );
        Self::assemble(chunks, vectors, lexical, manifest)
    }

    fn assemble(
        chunks: Vec<Chunk>,
        vectors: Vec<f32>,
        lexical: LexicalIndex,
        manifest: Manifest,
    ) -> Result<Self> {
        let dims = manifest.dims;
        if dims == 0 && !chunks.is_empty() {
            return Err(RagError::IndexUnavailable("manifest has zero dims".into()));
        }
        if vectors.len() != chunks.len() * dims {
            return Err(RagError::IndexUnavailable(format!(
                "embedding matrix has {} values, expected {} × {}",
                vectors.len(),
                chunks.len(),
                dims
            )));
        }
        if lexical.len() != chunks.len() {
            return Err(RagError::IndexUnavailable(format!(
                "lexical index covers {} chunks, corpus has {}",
                lexical.len(),
                chunks.len()
            )));
        }
        if manifest.chunk_count != chunks.len() {
            return Err(RagError::IndexUnavailable(format!(
                "manifest lists {} chunks, found {}",
                manifest.chunk_count,
                chunks.len()
            )));
        }
        Ok(Self {
            chunks,
            vectors,
            dims,
            lexical,
            manifest,
        })
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index dir: {}", dir.display()))?;

        // A stale manifest would make a half-written directory look valid.
        let manifest_path = dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            std::fs::remove_file(&manifest_path)?;
        }

        let mut out = std::io::BufWriter::new(std::fs::File::create(dir.join(CHUNKS_FILE))?);
        for chunk in &self.chunks {
            serde_json::to_writer(&mut out, chunk)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;

        std::fs::write(dir.join(EMBEDDINGS_FILE), vec_to_blob(&self.vectors))?;
        std::fs::write(dir.join(LEXICAL_FILE), serde_json::to_vec(&self.lexical)?)?;
        std::fs::write(&manifest_path, serde_json::to_vec_pretty(&self.manifest)?)?;

        tracing::info!(
            dir = %dir.display(),
            chunks = self.chunks.len(),
            dims = self.dims,
            "index saved"
        );
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let unavailable =
            |what: &str, e: &dyn std::fmt::Display| RagError::IndexUnavailable(format!("{}: {}", what, e));

        let manifest_raw = std::fs::read(dir.join(MANIFEST_FILE))
            .map_err(|e| unavailable(&format!("no manifest in {}", dir.display()), &e))?;
        let manifest: Manifest =
            serde_json::from_slice(&manifest_raw).map_err(|e| unavailable("invalid manifest", &e))?;
        if manifest.version != INDEX_FORMAT_VERSION {
            return Err(RagError::IndexUnavailable(format!(
                "index format v{} is not supported (expected v{}); re-run ingest",
                manifest.version, INDEX_FORMAT_VERSION
            )));
        }

        let file = std::fs::File::open(dir.join(CHUNKS_FILE))
            .map_err(|e| unavailable("cannot open chunks.jsonl", &e))?;
        let mut chunks = Vec::with_capacity(manifest.chunk_count);
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| unavailable("cannot read chunks.jsonl", &e))?;
            if line.trim().is_empty() {
                continue;
            }
            let chunk: Chunk = serde_json::from_str(&line)
                .map_err(|e| unavailable(&format!("chunks.jsonl line {}", n + 1), &e))?;
            chunks.push(chunk);
        }

        let blob = std::fs::read(dir.join(EMBEDDINGS_FILE))
            .map_err(|e| unavailable("cannot read embeddings.f32", &e))?;
        if blob.len() % 4 != 0 {
            return Err(RagError::IndexUnavailable(
                "embeddings.f32 is truncated".to_string(),
            ));
        }
        let vectors = blob_to_vec(&blob);

        let lexical_raw = std::fs::read(dir.join(LEXICAL_FILE))
            .map_err(|e| unavailable("cannot read lexical.json", &e))?;
        let lexical: LexicalIndex = serde_json::from_slice(&lexical_raw)
            .map_err(|e| unavailable("invalid lexical.json", &e))?;

        let index = Self::assemble(chunks, vectors, lexical, manifest)?;
        tracing::info!(
            dir = %dir.display(),
            chunks = index.len(),
            model = %index.manifest.embedding_model,
            "index loaded"
        );
        Ok(index)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Unit embedding of the chunk at corpus position `i`.
    pub fn embedding(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dims..(i + 1) * self.dims]
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    /// Re-tune BM25 without rebuilding postings.
    pub fn set_bm25_params(&mut self, k1: f32, b: f32) {
        self.lexical.set_params(k1, b);
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use std::collections::BTreeMap;

    fn chunk(i: usize, text: &str) -> Chunk {
        Chunk {
            id: format!("c{}", i),
            article_id: format!("a{}", i),
            title: format!("Article {}", i),
            url: format!("https://help.example.com/{}", i),
            section: "Overview".to_string(),
            text: text.to_string(),
            doc_path: "kb.md".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    async fn sample() -> KnowledgeIndex {
        let chunks = vec![
            chunk(0, "Context: Timer\n\nStart the timer to track time."),
            chunk(1, "Context: Invoices\n\nCreate invoices from billable hours."),
            chunk(2, "Context: Kiosk\n\nEmployees clock in with a PIN."),
        ];
        KnowledgeIndex::build(chunks, &HashingProvider::new(32), 2, 1.2, 0.65)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_shapes() {
        let idx = sample().await;
        assert_eq!(idx.len(), 3);
        assert_eq!(idx.dims(), 32);
        assert_eq!(idx.embedding(2).len(), 32);
        assert_eq!(idx.lexical().len(), 3);
        assert_eq!(idx.manifest().embedding_model, "feature-hashing");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let idx = sample().await;
        idx.save(tmp.path()).unwrap();

        let loaded = KnowledgeIndex::load(tmp.path()).unwrap();
        assert_eq!(loaded.chunks(), idx.chunks());
        assert_eq!(loaded.embedding(1), idx.embedding(1));
        assert_eq!(loaded.manifest(), idx.manifest());
        assert_eq!(
            loaded.lexical().scores("invoices"),
            idx.lexical().scores("invoices")
        );
    }

    #[tokio::test]
    async fn test_configured_bm25_params_apply_after_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let idx = sample().await;
        idx.save(tmp.path()).unwrap();

        let mut loaded = KnowledgeIndex::load(tmp.path()).unwrap();
        let built_scores = loaded.lexical().scores("start the timer");
        loaded.set_bm25_params(3.0, 0.0);

        let texts: Vec<&str> = idx.chunks().iter().map(|c| c.text.as_str()).collect();
        let expected = LexicalIndex::build(texts, 3.0, 0.0);
        assert_eq!(
            loaded.lexical().scores("start the timer"),
            expected.scores("start the timer")
        );
        assert_ne!(loaded.lexical().scores("start the timer"), built_scores);
    }

    #[test]
    fn test_missing_dir_is_unavailable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = KnowledgeIndex::load(&tmp.path().join("nope")).err().unwrap();
        assert!(matches!(err, RagError::IndexUnavailable(_)));
    }

    #[tokio::test]
    async fn test_truncated_matrix_is_unavailable() {
        let tmp = tempfile::TempDir::new().unwrap();
        sample().await.save(tmp.path()).unwrap();

        let path = tmp.path().join(EMBEDDINGS_FILE);
        let mut blob = std::fs::read(&path).unwrap();
        blob.truncate(blob.len() - 4);
        std::fs::write(&path, blob).unwrap();

        let err = KnowledgeIndex::load(tmp.path()).err().unwrap();
        assert!(matches!(err, RagError::IndexUnavailable(_)));
    }

    #[test]
    fn test_mismatched_parts_rejected() {
        let manifest = Manifest {
            version: INDEX_FORMAT_VERSION,
            chunk_count: 1,
            dims: 4,
            embedding_model: "m".into(),
            built_at: Utc::now(),
            bm25_k1: 1.2,
            bm25_b: 0.65,
        };
        let err = KnowledgeIndex::from_parts(vec![chunk(0, "x")], vec![0.0; 3], manifest)
            .err()
            .unwrap();
        assert!(matches!(err, RagError::IndexUnavailable(_)));
    }
}
