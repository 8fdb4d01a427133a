//! The answer pipeline.
//!
//! ```text
//! question ─▶ validate ─▶ rate limit ─▶ cache ──hit──────────────────────────▶ payload
//!                                        │miss
//!                                        ▼
//!                     embed ─▶ score/fuse/MMR/pack (blocking pool)
//!                                        │
//!                          coverage gate ─┴─ weak ─▶ refusal
//!                                        │
//!                      breaker ─▶ model ─▶ contract ─(bad)─▶ one corrective retry
//!                                        │
//!                      resolve sources ─▶ route ─▶ cache + query log ─▶ payload
//! ```
//!
//! [`SupportEngine`] owns every service object (limiter, breaker, cache,
//! query log) explicitly; nothing is process-global.

use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::cache::{cache_key, QueryCache};
use crate::circuit::{BreakerSettings, CircuitBreaker};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, RetrievalConfig};
use crate::contract::{parse_answer, AnswerContractError, ValidatedAnswer};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::expand::QueryExpander;
use crate::index::KnowledgeIndex;
use crate::llm::{ChatMessage, InferenceInvoker, OllamaChatClient};
use crate::models::{
    AnswerMetadata, AnswerPayload, CacheStatus, ChunkRef, Routing, SourceRef, Timing,
};
use crate::pack::{ApproxTokenizer, Tokenizer};
use crate::prompt;
use crate::query_log::QueryLog;
use crate::rate_limit::RateLimiter;
use crate::search::{retrieve, Retrieval, RetrievalParams};
use crate::telemetry;

pub const REFUSAL_ANSWER: &str = "I don't have enough information in the documentation to answer this reliably. \
Please escalate to a support specialist.";

pub const REFUSAL_LOW_COVERAGE: &str = "insufficient_context";
pub const REFUSAL_CONTRACT: &str = "invalid_model_output";

/// Per-request context threaded through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub correlation_id: Option<String>,
}

impl RequestContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// Context with a fresh 32-character hex id.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Optional per-request overrides of the configured retrieval knobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnswerParams {
    pub top_k: Option<usize>,
    pub pack_top: Option<usize>,
    pub threshold: Option<f32>,
}

pub struct SupportEngine {
    index: Arc<KnowledgeIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    invoker: Arc<dyn InferenceInvoker>,
    tokenizer: Arc<dyn Tokenizer>,
    expander: Option<QueryExpander>,
    limiter: Option<RateLimiter>,
    breaker: CircuitBreaker,
    cache: Option<QueryCache>,
    query_log: Option<QueryLog>,
    workers: Arc<Semaphore>,
    retrieval: RetrievalConfig,
    temperature: f32,
    corrective_retry: bool,
}

impl SupportEngine {
    /// Wire an engine from already constructed collaborators.
    pub fn new(
        config: &Config,
        index: Arc<KnowledgeIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        invoker: Arc<dyn InferenceInvoker>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let limiter = config
            .rate_limit
            .enabled
            .then(|| RateLimiter::from_config(&config.rate_limit, clock.clone()));
        let cache = config
            .cache
            .enabled
            .then(|| QueryCache::from_config(&config.cache, clock.clone()));
        let breaker = CircuitBreaker::new(
            invoker.model_name().to_string(),
            BreakerSettings::from(&config.circuit_breaker),
            clock,
        );

        Ok(Self {
            index,
            embedder,
            invoker,
            tokenizer: Arc::new(ApproxTokenizer),
            expander: QueryExpander::from_config(&config.retrieval)?,
            limiter,
            breaker,
            cache,
            query_log: QueryLog::from_config(&config.query_log),
            workers: Arc::new(Semaphore::new(config.server.workers.max(1))),
            retrieval: config.retrieval.clone(),
            temperature: config.llm.temperature,
            corrective_retry: config.llm.corrective_retry,
        })
    }

    /// Load the index and connect the configured providers.
    ///
    /// Relative paths in `config` resolve against `base_dir`. A persisted
    /// cache file, when configured, is loaded.
    pub async fn from_config(config: &Config, base_dir: &Path) -> anyhow::Result<Self> {
        let index_dir = base_dir.join(&config.index.dir);
        let mut index = KnowledgeIndex::load(&index_dir)?;
        index.set_bm25_params(config.retrieval.bm25_k1, config.retrieval.bm25_b);
        let embedder = embedding::create_provider(&config.embedding)?;
        if index.manifest().embedding_model != embedder.model_name()
            || index.dims() != embedder.dims()
        {
            return Err(RagError::IndexUnavailable(format!(
                "index was built with {} ({} dims) but the configured embedder is {} ({} dims), re-run ingest",
                index.manifest().embedding_model,
                index.dims(),
                embedder.model_name(),
                embedder.dims()
            ))
            .into());
        }
        let invoker: Arc<dyn InferenceInvoker> = Arc::new(OllamaChatClient::new(&config.llm)?);

        let engine = Self::new(
            config,
            Arc::new(index),
            embedder,
            invoker,
            Arc::new(SystemClock::new()),
        )?;

        if let (Some(cache), Some(path)) = (&engine.cache, &config.cache.path) {
            if let Err(e) = cache.load(&base_dir.join(path)) {
                tracing::warn!(error = %e, "ignoring unreadable cache file");
            }
        }
        Ok(engine)
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Turn off query logging regardless of configuration.
    pub fn without_query_log(mut self) -> Self {
        self.query_log = None;
        self
    }

    pub fn index(&self) -> &KnowledgeIndex {
        &self.index
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_ref()
    }

    pub fn model_name(&self) -> &str {
        self.invoker.model_name()
    }

    /// Answer `question`, or explain why it cannot be answered.
    ///
    /// Weak retrieval and a model that twice breaks the output contract both
    /// produce a refusal payload rather than an error.
    pub async fn answer(
        &self,
        ctx: &RequestContext,
        question: &str,
        params: &AnswerParams,
    ) -> Result<AnswerPayload> {
        let span = tracing::info_span!(
            "answer",
            correlation_id = ctx.correlation_id.as_deref().unwrap_or("-")
        );
        let started = Instant::now();
        let result = self
            .answer_inner(ctx, question, params)
            .instrument(span)
            .await;
        telemetry::record_query(&result, started.elapsed());
        telemetry::set_circuit_state(self.breaker.state());
        result
    }

    async fn answer_inner(
        &self,
        ctx: &RequestContext,
        question: &str,
        params: &AnswerParams,
    ) -> Result<AnswerPayload> {
        let started = Instant::now();
        let question = self.validate_question(question)?;
        let retrieval_params = self.effective_params(params)?;

        if let Some(limiter) = &self.limiter {
            limiter.try_acquire().map_err(|retry_after| {
                tracing::warn!(retry_after_secs = retry_after.as_secs_f64(), "rate limit exceeded");
                RagError::RateLimitExceeded { retry_after }
            })?;
        }

        let key_params = json!({
            "retrieval": retrieval_params,
            "model": self.invoker.model_name(),
            "index_built_at": self.index.manifest().built_at,
        });
        let key = cache_key(question, &key_params);

        let cache_status = match &self.cache {
            Some(cache) => match cache.get(&key) {
                Some(mut hit) => {
                    tracing::info!("cache hit");
                    telemetry::record_cache(true);
                    hit.metadata.cache_status = CacheStatus::Hit;
                    hit.metadata.correlation_id = ctx.correlation_id.clone();
                    hit.timing = Timing {
                        retrieve_ms: 0,
                        llm_ms: 0,
                        total_ms: elapsed_ms(started),
                    };
                    self.log_query(question, &hit, &[]);
                    return Ok(hit);
                }
                None => {
                    telemetry::record_cache(false);
                    CacheStatus::Miss
                }
            },
            None => CacheStatus::Disabled,
        };

        let retrieve_started = Instant::now();
        let query_vec = embedding::embed_query(self.embedder.as_ref(), question).await?;
        let lexical_query = match &self.expander {
            Some(expander) => expander.expand(question),
            None => question.to_string(),
        };
        let retrieval = self
            .run_retrieval(lexical_query, query_vec, retrieval_params.clone())
            .await?;
        let retrieve_ms = elapsed_ms(retrieve_started);

        let mut payload = AnswerPayload {
            answer: REFUSAL_ANSWER.to_string(),
            confidence: None,
            reasoning: None,
            refused: true,
            refusal_reason: None,
            selected_chunks: Vec::new(),
            packed_chunk_ids: retrieval.packed.chunk_ids.clone(),
            timing: Timing {
                retrieve_ms,
                llm_ms: 0,
                total_ms: 0,
            },
            routing: Routing::for_answer(None, true),
            metadata: AnswerMetadata {
                cache_status,
                correlation_id: ctx.correlation_id.clone(),
                retrieval_count: retrieval.candidates.len(),
                packed_count: retrieval.packed.chunk_ids.len(),
                tokens_used: retrieval.packed.tokens_used,
                model: self.invoker.model_name().to_string(),
                corrective_retry: false,
            },
        };

        let mut cacheable = true;
        if !retrieval.covers(retrieval_params.threshold) {
            tracing::info!(
                best_dense = ?retrieval.best_dense,
                threshold = retrieval_params.threshold,
                packed = retrieval.packed.chunk_ids.len(),
                "coverage below threshold, refusing"
            );
            payload.refusal_reason = Some(REFUSAL_LOW_COVERAGE.to_string());
        } else {
            let llm_started = Instant::now();
            let (outcome, corrected) = self.generate(question, &retrieval).await?;
            payload.timing.llm_ms = elapsed_ms(llm_started);
            payload.metadata.corrective_retry = corrected;

            match outcome {
                Ok(validated) => {
                    payload.selected_chunks = self.resolve_sources(&validated, &retrieval);
                    payload.answer = validated.answer;
                    payload.confidence = Some(validated.confidence);
                    payload.reasoning = Some(validated.reasoning);
                    payload.refused = false;
                    payload.routing = Routing::for_answer(payload.confidence, false);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "model output rejected after corrective retry");
                    payload.refusal_reason = Some(format!("{}: {}", REFUSAL_CONTRACT, e));
                    cacheable = false;
                }
            }
        }

        payload.timing.total_ms = elapsed_ms(started);

        if let (Some(cache), true) = (&self.cache, cacheable) {
            cache.put(&key, key_params, payload.clone());
        }

        let chunk_texts: Vec<&str> = retrieval
            .packed
            .indices
            .iter()
            .filter_map(|&i| self.index.chunks().get(i))
            .map(|c| c.text.as_str())
            .collect();
        self.log_query(question, &payload, &chunk_texts);

        tracing::info!(
            refused = payload.refused,
            confidence = ?payload.confidence,
            action = ?payload.routing.action,
            total_ms = payload.timing.total_ms,
            "answered"
        );
        Ok(payload)
    }

    fn validate_question<'q>(&self, question: &'q str) -> Result<&'q str> {
        let trimmed = question.trim();
        if trimmed.is_empty() {
            return Err(RagError::Validation("Query cannot be empty".to_string()));
        }
        let len = trimmed.chars().count();
        if len > self.retrieval.max_query_length {
            return Err(RagError::Validation(format!(
                "Query too long ({} chars). Maximum allowed: {} chars",
                len, self.retrieval.max_query_length
            )));
        }
        Ok(trimmed)
    }

    fn effective_params(&self, params: &AnswerParams) -> Result<RetrievalParams> {
        let mut effective = RetrievalParams::from_config(&self.retrieval);

        if let Some(top_k) = params.top_k {
            if top_k == 0 || top_k > self.retrieval.max_top_k {
                return Err(RagError::Validation(format!(
                    "top_k must be between 1 and {}",
                    self.retrieval.max_top_k
                )));
            }
            effective.top_k = top_k;
        }
        if let Some(pack_top) = params.pack_top {
            if pack_top == 0 {
                return Err(RagError::Validation("pack_top must be at least 1".to_string()));
            }
            effective.pack_top = pack_top;
        }
        if let Some(threshold) = params.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(RagError::Validation(
                    "threshold must be between 0.0 and 1.0".to_string(),
                ));
            }
            effective.threshold = threshold;
        }
        Ok(effective)
    }

    async fn run_retrieval(
        &self,
        lexical_query: String,
        query_vec: Vec<f32>,
        params: RetrievalParams,
    ) -> Result<Retrieval> {
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RagError::Internal(format!("worker pool closed: {}", e)))?;

        let index = self.index.clone();
        let tokenizer = self.tokenizer.clone();
        tokio::task::spawn_blocking(move || {
            retrieve(&index, &lexical_query, &query_vec, &params, tokenizer.as_ref())
        })
        .await
        .map_err(|e| RagError::Internal(format!("retrieval task failed: {}", e)))
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String> {
        self.breaker
            .call(|| async {
                self.invoker
                    .invoke(messages, self.temperature)
                    .await
                    .map_err(RagError::from)
            })
            .await
    }

    /// Ask the model, retrying once with a corrective turn when the reply
    /// breaks the contract. Returns the final validation outcome and whether
    /// the retry was used.
    async fn generate(
        &self,
        question: &str,
        retrieval: &Retrieval,
    ) -> Result<(std::result::Result<ValidatedAnswer, AnswerContractError>, bool)> {
        let messages = prompt::messages(question, &retrieval.packed);
        let raw = self.invoke(&messages).await?;

        match parse_answer(&raw) {
            Ok(validated) => Ok((Ok(validated), false)),
            Err(e) if self.corrective_retry => {
                tracing::warn!(error = %e, "model reply broke the answer contract, retrying once");
                let retry = prompt::corrective_messages(&messages, &raw, &e.to_string());
                let raw = self.invoke(&retry).await?;
                Ok((parse_answer(&raw), true))
            }
            Err(e) => Ok((Err(e), false)),
        }
    }

    fn resolve_sources(&self, answer: &ValidatedAnswer, retrieval: &Retrieval) -> Vec<SourceRef> {
        let packed_len = retrieval.packed.chunk_ids.len();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for citation in &answer.sources_used {
            let reference = ChunkRef::from_citation(citation, packed_len);
            match reference.resolve(self.index.chunks(), &retrieval.packed) {
                Some(source) => {
                    if seen.insert(source.id.clone()) {
                        out.push(source);
                    }
                }
                None => tracing::debug!(citation = %citation, "unresolvable source citation dropped"),
            }
        }
        out
    }

    fn log_query(&self, question: &str, payload: &AnswerPayload, chunk_texts: &[&str]) {
        if let Some(log) = &self.query_log {
            log.record(question, payload, chunk_texts);
        }
    }
}

/// `srag ask`: answer one question from the command line.
pub async fn run_ask(
    config: &Config,
    base_dir: &Path,
    question: &str,
    json_output: bool,
    debug: bool,
    no_log: bool,
) -> anyhow::Result<()> {
    let mut engine = SupportEngine::from_config(config, base_dir).await?;
    if no_log {
        engine = engine.without_query_log();
    }

    let ctx = RequestContext::generate();
    let payload = engine
        .answer(&ctx, question, &AnswerParams::default())
        .await?;
    persist_cache(&engine, config, base_dir);

    if json_output {
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    print_payload(&payload, &ctx, debug);
    Ok(())
}

/// `srag chat`: answer questions read line by line from stdin.
///
/// One engine serves the whole session, so repeated questions hit the
/// cache. `exit`, `quit` or end of input ends the session.
pub async fn run_chat(
    config: &Config,
    base_dir: &Path,
    debug: bool,
    no_log: bool,
) -> anyhow::Result<()> {
    let mut engine = SupportEngine::from_config(config, base_dir).await?;
    if no_log {
        engine = engine.without_query_log();
    }

    println!("Ask a support question. Type 'exit' or press Ctrl-D to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        let ctx = RequestContext::generate();
        match engine.answer(&ctx, question, &AnswerParams::default()).await {
            Ok(payload) => print_payload(&payload, &ctx, debug),
            Err(e) => eprintln!("error: {}", e),
        }
        println!();
    }

    persist_cache(&engine, config, base_dir);
    Ok(())
}

fn persist_cache(engine: &SupportEngine, config: &Config, base_dir: &Path) {
    if let (Some(cache), Some(path)) = (engine.cache(), &config.cache.path) {
        if let Err(e) = cache.save(&base_dir.join(path)) {
            tracing::warn!(error = %e, "failed to persist cache");
        }
    }
}

fn print_payload(payload: &AnswerPayload, ctx: &RequestContext, debug: bool) {
    println!("{}", payload.answer);
    println!();
    if !payload.selected_chunks.is_empty() {
        println!("Sources:");
        for source in &payload.selected_chunks {
            let title = source.title.as_deref().unwrap_or("(untitled)");
            println!("  - {} <{}>", title, source.url);
        }
    }
    match payload.confidence {
        Some(c) => println!("Confidence: {} ({})", c, payload.routing.action.as_str()),
        None => println!("Confidence: n/a ({})", payload.routing.action.as_str()),
    }

    if !debug {
        return;
    }
    println!();
    println!("correlation id: {}", ctx.correlation_id.as_deref().unwrap_or("-"));
    if let Some(reason) = &payload.refusal_reason {
        println!("refusal: {}", reason);
    }
    if let Some(reasoning) = &payload.reasoning {
        println!("reasoning: {}", reasoning);
    }
    println!(
        "retrieved {} / packed {} chunks, {} tokens",
        payload.metadata.retrieval_count,
        payload.metadata.packed_count,
        payload.metadata.tokens_used
    );
    println!("packed: {}", payload.packed_chunk_ids.join(", "));
    println!(
        "timing: retrieve {}ms, llm {}ms, total {}ms",
        payload.timing.retrieve_ms, payload.timing.llm_ms, payload.timing.total_ms
    );
    println!("cache_status: {}", payload.metadata.cache_status.as_str());
    println!("corrective retry: {}", payload.metadata.corrective_retry);
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
