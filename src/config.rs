//! TOML configuration for the ingest, retrieval and answer pipeline.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! [`load_config`] parses the file, applies `RAG_*` environment overrides and
//! validates cross-field constraints before anything else runs.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub query_log: QueryLogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
        }
    }
}

fn default_index_dir() -> PathBuf {
    PathBuf::from("./data/index")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    /// Corpus file or directory. When unset, the first existing entry of
    /// `candidates` is used.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_candidates")]
    pub candidates: Vec<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Article ids dropped at ingest regardless of front matter flags.
    #[serde(default)]
    pub suppressed_ids: Vec<String>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: None,
            candidates: default_candidates(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            suppressed_ids: Vec::new(),
        }
    }
}

fn default_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("knowledge_base"),
        PathBuf::from("help_corpus.en.md"),
        PathBuf::from("knowledge_full.md"),
    ]
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

impl CorpusConfig {
    /// Resolve the corpus location relative to `base`.
    ///
    /// Returns the resolved path and whether it exists. With no explicit
    /// `path`, the first existing candidate wins; if none exist the first
    /// candidate is returned so error messages point somewhere sensible.
    pub fn resolve(&self, base: &Path) -> (PathBuf, bool) {
        if let Some(p) = &self.path {
            let full = base.join(p);
            let exists = full.exists();
            return (full, exists);
        }
        for candidate in &self.candidates {
            let full = base.join(candidate);
            if full.exists() {
                return (full, true);
            }
        }
        let first = self
            .candidates
            .first()
            .map(|c| base.join(c))
            .unwrap_or_else(|| base.to_path_buf());
        (first, false)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_chars() -> usize {
    1600
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_pack_top")]
    pub pack_top: usize,
    /// Minimum dense similarity the best candidate must reach before the
    /// model is consulted.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Lexical weight in the fused score: 1.0 is BM25 only, 0.0 dense only.
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f32,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f32,
    #[serde(default = "default_context_budget")]
    pub context_budget_tokens: usize,
    #[serde(default = "default_max_chunks_per_article")]
    pub max_chunks_per_article: usize,
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    #[serde(default = "default_expand_queries")]
    pub expand_queries: bool,
    /// JSON object of `term -> [synonyms]` replacing the built-in dictionary.
    #[serde(default)]
    pub expansion_file: Option<PathBuf>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            pack_top: default_pack_top(),
            threshold: default_threshold(),
            alpha: default_alpha(),
            mmr_lambda: default_mmr_lambda(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            context_budget_tokens: default_context_budget(),
            max_chunks_per_article: default_max_chunks_per_article(),
            max_query_length: default_max_query_length(),
            expand_queries: default_expand_queries(),
            expansion_file: None,
        }
    }
}

fn default_top_k() -> usize {
    15
}
fn default_max_top_k() -> usize {
    50
}
fn default_pack_top() -> usize {
    8
}
fn default_threshold() -> f32 {
    0.25
}
fn default_alpha() -> f32 {
    0.5
}
fn default_mmr_lambda() -> f32 {
    0.75
}
fn default_bm25_k1() -> f32 {
    1.2
}
fn default_bm25_b() -> f32 {
    0.65
}
fn default_context_budget() -> usize {
    6000
}
fn default_max_chunks_per_article() -> usize {
    3
}
fn default_max_query_length() -> usize {
    12000
}
fn default_expand_queries() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hashing` (offline, deterministic) or `ollama`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embed_model(),
            dims: default_dims(),
            url: default_ollama_url(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_ollama_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    #[serde(default = "default_num_predict")]
    pub num_predict: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: f64,
    /// Retry once with a corrective instruction when the output breaks the
    /// answer contract.
    #[serde(default = "default_true")]
    pub corrective_retry: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_chat_model(),
            temperature: 0.0,
            num_ctx: default_num_ctx(),
            num_predict: default_num_predict(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            corrective_retry: true,
        }
    }
}

impl LlmConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout_secs)
    }
}

fn default_chat_model() -> String {
    "qwen2.5:32b".to_string()
}
fn default_num_ctx() -> u32 {
    32768
}
fn default_num_predict() -> u32 {
    512
}
fn default_connect_timeout_secs() -> f64 {
    3.0
}
fn default_read_timeout_secs() -> f64 {
    120.0
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// JSONL file the cache is loaded from at startup and saved to on exit.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_cache_max_size(),
            ttl_secs: default_cache_ttl_secs(),
            path: None,
        }
    }
}

fn default_cache_max_size() -> usize {
    100
}
fn default_cache_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_requests")]
    pub max_requests: usize,
    #[serde(default = "default_rate_limit_window")]
    pub window_secs: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: default_rate_limit_requests(),
            window_secs: default_rate_limit_window(),
        }
    }
}

fn default_rate_limit_requests() -> usize {
    10
}
fn default_rate_limit_window() -> f64 {
    60.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_secs")]
    pub recovery_secs: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_open_secs")]
    pub max_open_secs: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_secs: default_recovery_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_open_secs: default_max_open_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_secs() -> f64 {
    30.0
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_open_secs() -> f64 {
    300.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Concurrent retrieval jobs allowed on the blocking pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Strip titles and section labels from returned sources.
    #[serde(default)]
    pub privacy_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: default_workers(),
            request_timeout_secs: default_request_timeout_secs(),
            privacy_mode: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_workers() -> usize {
    4
}
fn default_request_timeout_secs() -> u64 {
    180
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryLogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub include_answer: bool,
    #[serde(default)]
    pub include_chunks: bool,
}

impl Default for QueryLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_log_path(),
            include_answer: true,
            include_chunks: false,
        }
    }
}

fn default_log_path() -> PathBuf {
    PathBuf::from("rag_queries.jsonl")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;

    Ok(config)
}

/// Apply `RAG_OLLAMA_URL`, `RAG_CHAT_MODEL` and `RAG_EMBED_MODEL`.
///
/// `lookup` is injected so tests never touch the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = non_empty("RAG_OLLAMA_URL") {
        config.llm.url = url.clone();
        config.embedding.url = url;
    }
    if let Some(model) = non_empty("RAG_CHAT_MODEL") {
        config.llm.model = model;
    }
    if let Some(model) = non_empty("RAG_EMBED_MODEL") {
        config.embedding.model = model;
    }
}

/// Durations are built with `Duration::from_secs_f64`, which panics on NaN or infinity.
fn positive_finite(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_chars {
        anyhow::bail!(
            "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_chars ({})",
            config.chunking.chunk_overlap,
            config.chunking.chunk_chars
        );
    }

    // Retrieval
    let r = &config.retrieval;
    if r.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if r.top_k > r.max_top_k {
        anyhow::bail!(
            "retrieval.top_k ({}) must not exceed retrieval.max_top_k ({})",
            r.top_k,
            r.max_top_k
        );
    }
    if r.pack_top < 1 {
        anyhow::bail!("retrieval.pack_top must be >= 1");
    }
    for (name, value) in [
        ("alpha", r.alpha),
        ("mmr_lambda", r.mmr_lambda),
        ("threshold", r.threshold),
        ("bm25_b", r.bm25_b),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if !positive_finite(r.bm25_k1 as f64) {
        anyhow::bail!("retrieval.bm25_k1 must be a finite number > 0");
    }
    if r.context_budget_tokens == 0 {
        anyhow::bail!("retrieval.context_budget_tokens must be > 0");
    }
    if r.max_query_length == 0 {
        anyhow::bail!("retrieval.max_query_length must be > 0");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "hashing" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashing or ollama.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // LLM
    if !positive_finite(config.llm.connect_timeout_secs)
        || !positive_finite(config.llm.read_timeout_secs)
    {
        anyhow::bail!("llm timeouts must be finite numbers > 0");
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }

    // Cache
    if config.cache.enabled && (config.cache.max_size == 0 || config.cache.ttl_secs == 0) {
        anyhow::bail!("cache.max_size and cache.ttl_secs must be > 0 when the cache is enabled");
    }

    // Rate limiting
    if config.rate_limit.max_requests == 0 {
        anyhow::bail!("rate_limit.max_requests must be >= 1");
    }
    if !positive_finite(config.rate_limit.window_secs) {
        anyhow::bail!("rate_limit.window_secs must be a finite number > 0");
    }

    // Circuit breaker
    let cb = &config.circuit_breaker;
    if cb.failure_threshold == 0 {
        anyhow::bail!("circuit_breaker.failure_threshold must be >= 1");
    }
    if !positive_finite(cb.recovery_secs) {
        anyhow::bail!("circuit_breaker.recovery_secs must be a finite number > 0");
    }
    if !cb.backoff_multiplier.is_finite() || cb.backoff_multiplier < 1.0 {
        anyhow::bail!("circuit_breaker.backoff_multiplier must be >= 1.0");
    }
    if !cb.max_open_secs.is_finite() || cb.max_open_secs < cb.recovery_secs {
        anyhow::bail!("circuit_breaker.max_open_secs must be finite and >= recovery_secs");
    }

    // Server
    if config.server.workers == 0 {
        anyhow::bail!("server.workers must be >= 1");
    }
    if config.server.request_timeout_secs == 0 {
        anyhow::bail!("server.request_timeout_secs must be > 0");
    }

    Ok(())
}

/// `srag config`: print the effective, validated configuration.
pub fn print_summary(config: &Config, path: &Path, base_dir: &Path) {
    let (corpus, exists) = config.corpus.resolve(base_dir);
    println!("Config: {}", path.display());
    println!(
        "  corpus: {}{}",
        corpus.display(),
        if exists { "" } else { " (missing)" }
    );
    println!("  index: {}", base_dir.join(&config.index.dir).display());
    println!(
        "  chunking: {} chars, {} overlap",
        config.chunking.chunk_chars, config.chunking.chunk_overlap
    );
    let r = &config.retrieval;
    println!(
        "  retrieval: top_k={} pack_top={} alpha={} mmr_lambda={} threshold={} budget={} tokens",
        r.top_k, r.pack_top, r.alpha, r.mmr_lambda, r.threshold, r.context_budget_tokens
    );
    println!(
        "  embedding: {} ({}, {} dims)",
        config.embedding.provider, config.embedding.model, config.embedding.dims
    );
    println!("  llm: {} at {}", config.llm.model, config.llm.url);
    println!(
        "  cache: {}",
        if config.cache.enabled {
            format!("{} entries, ttl {}s", config.cache.max_size, config.cache.ttl_secs)
        } else {
            "disabled".to_string()
        }
    );
    println!(
        "  rate limit: {}",
        if config.rate_limit.enabled {
            format!(
                "{} per {}s",
                config.rate_limit.max_requests, config.rate_limit.window_secs
            )
        } else {
            "disabled".to_string()
        }
    );
    println!("  server: {} ({} workers)", config.server.bind, config.server.workers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.chunking.chunk_chars, 1600);
        assert_eq!(config.chunking.chunk_overlap, 200);
        assert_eq!(config.retrieval.top_k, 15);
        assert_eq!(config.retrieval.pack_top, 8);
        assert!((config.retrieval.alpha - 0.5).abs() < f32::EPSILON);
        assert!((config.retrieval.bm25_k1 - 1.2).abs() < f32::EPSILON);
        assert_eq!(config.cache.max_size, 100);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert!(!config.query_log.enabled);
        assert_eq!(config.embedding.provider, "hashing");
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse(include_str!("../config/srag.example.toml")).unwrap();
        assert_eq!(config.embedding.provider, "ollama");
        assert_eq!(config.embedding.dims, 768);
        assert_eq!(config.cache.path.as_deref(), Some(Path::new("../data/query_cache.jsonl")));
        assert!(config.llm.corrective_retry);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let err = parse("[chunking]\nchunk_chars = 100\nchunk_overlap = 100\n").unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn test_top_k_above_max_rejected() {
        let err = parse("[retrieval]\ntop_k = 60\nmax_top_k = 50\n").unwrap_err();
        assert!(err.to_string().contains("max_top_k"));
    }

    #[test]
    fn test_alpha_out_of_range_rejected() {
        let err = parse("[retrieval]\nalpha = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("retrieval.alpha"));
    }

    #[test]
    fn test_non_finite_durations_rejected() {
        let err = parse("[rate_limit]\nwindow_secs = inf\n").unwrap_err();
        assert!(err.to_string().contains("rate_limit.window_secs"));

        let err = parse("[circuit_breaker]\nrecovery_secs = nan\n").unwrap_err();
        assert!(err.to_string().contains("circuit_breaker.recovery_secs"));

        let err = parse("[circuit_breaker]\nmax_open_secs = inf\n").unwrap_err();
        assert!(err.to_string().contains("circuit_breaker.max_open_secs"));

        let err = parse("[llm]\nread_timeout_secs = inf\n").unwrap_err();
        assert!(err.to_string().contains("llm timeouts"));

        let err = parse("[retrieval]\nbm25_k1 = inf\n").unwrap_err();
        assert!(err.to_string().contains("retrieval.bm25_k1"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("RAG_OLLAMA_URL", "http://gpu-box:11434"),
            ("RAG_CHAT_MODEL", "llama3"),
            ("RAG_EMBED_MODEL", "   "),
        ]
        .into_iter()
        .collect();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.llm.url, "http://gpu-box:11434");
        assert_eq!(config.embedding.url, "http://gpu-box:11434");
        assert_eq!(config.llm.model, "llama3");
        assert_eq!(config.embedding.model, "nomic-embed-text");
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/srag.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_corpus_resolution_prefers_first_existing_candidate() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("knowledge_full.md"), "legacy").unwrap();

        let corpus = CorpusConfig::default();
        let (path, exists) = corpus.resolve(tmp.path());
        assert!(exists);
        assert!(path.ends_with("knowledge_full.md"));

        std::fs::write(tmp.path().join("help_corpus.en.md"), "primary").unwrap();
        let (path, _) = corpus.resolve(tmp.path());
        assert!(path.ends_with("help_corpus.en.md"));
    }

    #[test]
    fn test_corpus_resolution_none_exist() {
        let tmp = TempDir::new().unwrap();
        let (path, exists) = CorpusConfig::default().resolve(tmp.path());
        assert!(!exists);
        assert!(path.ends_with("knowledge_base"));
    }
}
