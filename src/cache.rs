//! TTL + LRU cache of answer payloads with JSONL persistence.
//!
//! Keys are content hashes of the normalized question and the effective
//! retrieval parameters, so a changed `top_k` or threshold never serves a
//! stale answer. Expiry runs on the injected monotonic [`Clock`]; persisted
//! records carry wall-clock `stored_at` so TTLs survive a restart.

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::models::AnswerPayload;

/// Stable key for a question under a set of effective parameters.
pub fn cache_key<P: Serialize>(question: &str, params: &P) -> String {
    let normalized = question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let params = serde_json::to_string(params).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0x1f]);
    hasher.update(params.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

struct Entry {
    params: Value,
    payload: AnswerPayload,
    /// Clock reading at which the entry stops being served.
    expires_at: Duration,
    /// Position in `Inner::recency`.
    tick: u64,
}

/// Entries plus two ordered indices over them: last use and expiry.
#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Use tick → key, least recently used first.
    recency: BTreeMap<u64, String>,
    expiry: BTreeSet<(Duration, String)>,
    next_tick: u64,
    hits: u64,
    misses: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn insert(&mut self, key: String, params: Value, payload: AnswerPayload, expires_at: Duration) {
        self.remove(&key);
        let tick = self.tick();
        self.recency.insert(tick, key.clone());
        self.expiry.insert((expires_at, key.clone()));
        self.entries.insert(
            key,
            Entry {
                params,
                payload,
                expires_at,
                tick,
            },
        );
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
            self.expiry.remove(&(entry.expires_at, key.to_string()));
        }
    }

    fn purge_expired(&mut self, now: Duration) {
        while self.expiry.first().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, key)) = self.expiry.pop_first() {
                if let Some(entry) = self.entries.remove(&key) {
                    self.recency.remove(&entry.tick);
                }
            }
        }
    }

    fn evict_over(&mut self, max_size: usize) {
        while self.entries.len() > max_size {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.expiry.remove(&(entry.expires_at, oldest.clone()));
            }
            tracing::debug!(key = %oldest, "evicted least recently used cache entry");
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Record {
    key: String,
    params: Value,
    payload: AnswerPayload,
    stored_at: DateTime<Utc>,
    ttl_secs: u64,
}

pub struct QueryCache {
    max_size: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl QueryCache {
    pub fn new(max_size: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl,
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn from_config(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.max_size, Duration::from_secs(config.ttl_secs), clock)
    }

    fn expired(&self, entry: &Entry, now: Duration) -> bool {
        now >= entry.expires_at
    }

    /// Unexpired payload for `key`; a hit refreshes its recency.
    pub fn get(&self, key: &str) -> Option<AnswerPayload> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let state = inner.entries.get(key).map(|e| self.expired(e, now));
        match state {
            Some(false) => {
                inner.hits += 1;
                inner.touch(key);
                inner.entries.get(key).map(|e| e.payload.clone())
            }
            Some(true) => {
                inner.remove(key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: &str, params: Value, payload: AnswerPayload) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        inner.purge_expired(now);
        inner.insert(key.to_string(), params, payload, now + self.ttl);
        inner.evict_over(self.max_size);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.entries.len(),
        }
    }

    /// Write every unexpired entry as one JSON line, least recent first.
    ///
    /// The file is replaced atomically via a temporary sibling.
    pub fn save(&self, path: &Path) -> anyhow::Result<usize> {
        let now = self.clock.now();
        let wall_now = Utc::now();

        let records: Vec<Record> = {
            let inner = self.inner.lock();
            inner
                .recency
                .values()
                .filter_map(|k| inner.entries.get(k).map(|e| (k, e)))
                .filter(|(_, e)| !self.expired(e, now))
                .map(|(k, e)| {
                    let remaining = e.expires_at.saturating_sub(now);
                    let age = self.ttl.saturating_sub(remaining);
                    Record {
                        key: k.clone(),
                        params: e.params.clone(),
                        payload: e.payload.clone(),
                        stored_at: wall_now
                            - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero()),
                        ttl_secs: self.ttl.as_secs(),
                    }
                })
                .collect()
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut out = std::io::BufWriter::new(
                std::fs::File::create(&tmp)
                    .with_context(|| format!("Failed to create {}", tmp.display()))?,
            );
            for record in &records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        tracing::debug!(path = %path.display(), entries = records.len(), "cache saved");
        Ok(records.len())
    }

    /// Merge records from a JSONL file. Missing file loads nothing.
    ///
    /// Expired and malformed lines are skipped. Returns the number loaded.
    pub fn load(&self, path: &Path) -> anyhow::Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open cache file: {}", path.display()))?;

        let now = self.clock.now();
        let wall_now = Utc::now();
        let mut loaded = 0;

        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(path = %path.display(), line = n + 1, error = %e, "skipping malformed cache record");
                    continue;
                }
            };

            let age = (wall_now - record.stored_at).to_std().unwrap_or(Duration::ZERO);
            let ttl = Duration::from_secs(record.ttl_secs).min(self.ttl);
            if age >= ttl {
                continue;
            }

            let mut inner = self.inner.lock();
            inner.insert(record.key, record.params, record.payload, now + (ttl - age));
            inner.evict_over(self.max_size);
            loaded += 1;
        }

        tracing::info!(path = %path.display(), entries = loaded, "cache loaded");
        Ok(loaded)
    }
}
