//! Corpus ingestion: markdown articles with YAML front matter → [`Chunk`]s.
//!
//! A corpus is a single file or a directory tree filtered by include and
//! exclude globs. One file may hold several articles, each introduced by
//! its own front matter block:
//!
//! ```text
//! ---
//! title: "Timesheet view"
//! url: "https://help.example.com/timesheet-view"
//! category: "track-time-and-expenses"
//! slug: "timesheet-view"
//! ---
//! ## Timesheet view
//! Managers can review their team's time...
//! ```
//!
//! The legacy form carries `id`, `tags`, `detected_lang` and an optional
//! `section_importance` map keyed by section label. Articles flagged
//! `suppressed`/`deprecated`, with a retired `status`, or whose id is listed in
//! `corpus.suppressed_ids` are dropped. A broken front matter block skips that
//! one article and is reported; the rest of the corpus is still ingested.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::chunk::{chunk_section, ArticleInfo};
use crate::config::{ChunkingConfig, Config, CorpusConfig};
use crate::index::KnowledgeIndex;
use crate::models::Chunk;

const RETIRED_STATUSES: [&str; 3] = ["suppressed", "deprecated", "archived"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("corpus path does not exist: {}", .0.display())]
    MissingCorpus(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unparsable front matter in {} (article {ordinal}): {message}", path.display())]
    FrontMatter {
        path: PathBuf,
        ordinal: usize,
        message: String,
    },

    #[error("invalid glob pattern '{pattern}': {message}")]
    Glob { pattern: String, message: String },

    #[error("failed to walk corpus directory: {0}")]
    Walk(String),
}

/// Counters for one ingestion run.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub files: usize,
    pub articles: usize,
    pub suppressed: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub chunks: usize,
    /// Per-article failures that were skipped.
    pub errors: Vec<IngestError>,
}

#[derive(Debug)]
pub struct IngestedCorpus {
    pub chunks: Vec<Chunk>,
    pub report: IngestReport,
}

/// Ingest a corpus file or directory.
///
/// # Errors
///
/// Only corpus-level problems are returned (missing root, bad globs,
/// unreadable directory). Problems with an individual document are recorded
/// in [`IngestReport::errors`] and ingestion continues.
pub fn ingest_path(
    path: &Path,
    corpus: &CorpusConfig,
    chunking: &ChunkingConfig,
) -> Result<IngestedCorpus, IngestError> {
    if !path.exists() {
        return Err(IngestError::MissingCorpus(path.to_path_buf()));
    }

    let files = if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        scan_corpus_dir(path, corpus)?
    };

    let suppressed_ids: HashSet<&str> = corpus.suppressed_ids.iter().map(String::as_str).collect();
    let mut report = IngestReport::default();
    let mut chunks = Vec::new();
    let mut seen_urls = HashSet::new();

    for file in &files {
        report.files += 1;
        let content = match std::fs::read_to_string(file) {
            Ok(c) => c,
            Err(source) => {
                tracing::warn!(path = %file.display(), error = %source, "skipping unreadable document");
                report.failed += 1;
                report.errors.push(IngestError::Io {
                    path: file.clone(),
                    source,
                });
                continue;
            }
        };

        for parsed in split_articles(&content, file) {
            let article = match parsed {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping article");
                    report.failed += 1;
                    report.errors.push(e);
                    continue;
                }
            };

            if article.is_suppressed(&suppressed_ids) {
                tracing::debug!(article = %article.article_id, "suppressed article skipped");
                report.suppressed += 1;
                continue;
            }
            if !seen_urls.insert(article.url.clone()) {
                tracing::warn!(url = %article.url, path = %file.display(), "duplicate article url skipped");
                report.duplicates += 1;
                continue;
            }

            report.articles += 1;
            chunks.extend(article.into_chunks(chunking));
        }
    }

    report.chunks = chunks.len();
    tracing::info!(
        files = report.files,
        articles = report.articles,
        suppressed = report.suppressed,
        failed = report.failed,
        chunks = report.chunks,
        "corpus ingested"
    );

    Ok(IngestedCorpus { chunks, report })
}

fn scan_corpus_dir(root: &Path, corpus: &CorpusConfig) -> Result<Vec<PathBuf>, IngestError> {
    let include_set = build_globset(&corpus.include_globs)?;

    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(corpus.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(corpus.follow_symlinks) {
        let entry = entry.map_err(|e| IngestError::Walk(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy();

        if exclude_set.is_match(rel_str.as_ref()) || !include_set.is_match(rel_str.as_ref()) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    // Sort for deterministic chunk order
    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, IngestError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| IngestError::Glob {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| IngestError::Glob {
        pattern: patterns.join(","),
        message: e.to_string(),
    })
}

/// `srag ingest`: read the corpus, embed it and write the index directory.
pub async fn run_ingest(config: &Config, base_dir: &Path, dry_run: bool) -> anyhow::Result<()> {
    let (corpus_path, exists) = config.corpus.resolve(base_dir);
    if !exists {
        anyhow::bail!(
            "Corpus not found at {}. Set [corpus].path in the config.",
            corpus_path.display()
        );
    }

    let ingested = ingest_path(&corpus_path, &config.corpus, &config.chunking)?;
    let report = &ingested.report;
    println!("Ingest: {}", corpus_path.display());
    println!("  files scanned: {}", report.files);
    println!("  articles: {}", report.articles);
    println!("  suppressed: {}", report.suppressed);
    println!("  duplicates: {}", report.duplicates);
    println!("  failed: {}", report.failed);
    println!("  chunks: {}", report.chunks);
    for err in &report.errors {
        println!("  ! {}", err);
    }

    if dry_run {
        println!("Dry run, index not written.");
        return Ok(());
    }
    if ingested.chunks.is_empty() {
        anyhow::bail!("No chunks produced from {}", corpus_path.display());
    }

    let provider = crate::embedding::create_provider(&config.embedding)?;
    let index = KnowledgeIndex::build(
        ingested.chunks,
        provider.as_ref(),
        config.embedding.batch_size,
        config.retrieval.bm25_k1,
        config.retrieval.bm25_b,
    )
    .await?;

    let index_dir = base_dir.join(&config.index.dir);
    index.save(&index_dir)?;
    println!(
        "Index written to {} ({} chunks, {} dims, model {})",
        index_dir.display(),
        index.len(),
        index.dims(),
        index.manifest().embedding_model
    );
    Ok(())
}

// ============ Front matter ============

#[derive(Debug, Default, Deserialize)]
struct FrontMatter {
    #[serde(default)]
    id: Option<serde_yaml::Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    tags: Option<TagList>,
    #[serde(default)]
    detected_lang: Option<String>,
    #[serde(default)]
    suppressed: bool,
    #[serde(default)]
    deprecated: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    section_importance: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagList {
    Many(Vec<String>),
    One(String),
}

impl TagList {
    fn into_vec(self) -> Vec<String> {
        match self {
            TagList::Many(v) => v,
            TagList::One(s) => s
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug)]
struct Article {
    article_id: String,
    title: String,
    url: String,
    doc_path: String,
    body: String,
    legacy_id: Option<String>,
    flagged: bool,
    section_importance: BTreeMap<String, String>,
    metadata: BTreeMap<String, Value>,
}

impl Article {
    fn is_suppressed(&self, suppressed_ids: &HashSet<&str>) -> bool {
        self.flagged
            || suppressed_ids.contains(self.article_id.as_str())
            || self
                .legacy_id
                .as_deref()
                .is_some_and(|id| suppressed_ids.contains(id))
    }

    fn into_chunks(self, chunking: &ChunkingConfig) -> Vec<Chunk> {
        let info = ArticleInfo {
            article_id: &self.article_id,
            title: &self.title,
            url: &self.url,
            doc_path: &self.doc_path,
        };

        let mut chunks = Vec::new();
        for (ordinal, (label, body)) in split_sections(&self.body, &self.title)
            .into_iter()
            .enumerate()
        {
            let mut metadata = self.metadata.clone();
            if self.legacy_id.is_some() {
                metadata.insert("section_type".to_string(), Value::String(label.clone()));
                let importance = self
                    .section_importance
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(&label))
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| "normal".to_string());
                metadata.insert("section_importance".to_string(), Value::String(importance));
            }
            chunks.extend(chunk_section(
                &info,
                &label,
                ordinal,
                &body,
                chunking.chunk_chars,
                chunking.chunk_overlap,
                &metadata,
            ));
        }
        chunks
    }
}

/// Split file content into articles at each front matter block.
fn split_articles(content: &str, path: &Path) -> Vec<Result<Article, IngestError>> {
    let lines: Vec<&str> = content.lines().collect();
    let doc_path = path.to_string_lossy().to_string();

    // (front matter line range, body start line)
    let mut blocks: Vec<(usize, usize, usize)> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if is_fence(lines[i]) {
            if let Some(close) = (i + 1..lines.len()).find(|&j| is_fence(lines[j])) {
                if looks_like_front_matter(&lines[i + 1..close]) {
                    blocks.push((i + 1, close, close + 1));
                    i = close + 1;
                    continue;
                }
            }
        }
        i += 1;
    }

    if blocks.is_empty() {
        return vec![Ok(plain_article(content, path, &doc_path))];
    }

    let mut articles = Vec::with_capacity(blocks.len());
    for (ordinal, &(fm_start, fm_end, body_start)) in blocks.iter().enumerate() {
        let body_end = blocks
            .get(ordinal + 1)
            .map(|next| next.0 - 1)
            .unwrap_or(lines.len());
        let yaml = lines[fm_start..fm_end].join("\n");
        let body = lines[body_start..body_end].join("\n");

        let parsed = serde_yaml::from_str::<FrontMatter>(&yaml).map_err(|e| {
            IngestError::FrontMatter {
                path: path.to_path_buf(),
                ordinal,
                message: e.to_string(),
            }
        });
        articles.push(parsed.map(|fm| build_article(fm, body, path, &doc_path, ordinal)));
    }
    articles
}

fn is_fence(line: &str) -> bool {
    line.trim_end() == "---"
}

/// First non-blank line must read as a `key:` entry.
fn looks_like_front_matter(block: &[&str]) -> bool {
    let first = match block.iter().find(|l| !l.trim().is_empty()) {
        Some(l) => l.trim(),
        None => return false,
    };
    match first.split_once(':') {
        Some((key, _)) => {
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => false,
    }
}

fn build_article(fm: FrontMatter, body: String, path: &Path, doc_path: &str, ordinal: usize) -> Article {
    let legacy_id = fm.id.as_ref().and_then(scalar_to_string);
    let title = fm
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| first_heading(&body))
        .or_else(|| fm.slug.clone())
        .or_else(|| legacy_id.clone())
        .unwrap_or_else(|| file_stem(path));

    let fragment = legacy_id
        .clone()
        .or_else(|| fm.slug.clone())
        .unwrap_or_else(|| ordinal.to_string());
    let url = fm
        .url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| format!("file://{}#{}", doc_path, fragment));

    let article_id = legacy_id
        .clone()
        .or_else(|| fm.slug.clone())
        .unwrap_or_else(|| url.clone());

    let flagged = fm.suppressed
        || fm.deprecated
        || fm
            .status
            .as_deref()
            .is_some_and(|s| RETIRED_STATUSES.contains(&s.trim().to_ascii_lowercase().as_str()));

    let mut metadata = BTreeMap::new();
    if let Some(category) = &fm.category {
        metadata.insert("category".to_string(), Value::String(category.clone()));
    }
    if let Some(slug) = &fm.slug {
        metadata.insert("slug".to_string(), Value::String(slug.clone()));
    }
    if let Some(id) = &legacy_id {
        metadata.insert("id".to_string(), Value::String(id.clone()));
    }
    if let Some(tags) = fm.tags {
        let tags = tags.into_vec().into_iter().map(Value::String).collect();
        metadata.insert("tags".to_string(), Value::Array(tags));
    }
    if let Some(lang) = &fm.detected_lang {
        metadata.insert("detected_lang".to_string(), Value::String(lang.clone()));
    }

    Article {
        article_id,
        title,
        url,
        doc_path: doc_path.to_string(),
        body,
        legacy_id,
        flagged,
        section_importance: fm.section_importance,
        metadata,
    }
}

fn plain_article(content: &str, path: &Path, doc_path: &str) -> Article {
    let title = first_heading(content).unwrap_or_else(|| file_stem(path));
    let url = format!("file://{}", doc_path);
    Article {
        article_id: url.clone(),
        title,
        url,
        doc_path: doc_path.to_string(),
        body: content.to_string(),
        legacy_id: None,
        flagged: false,
        section_importance: BTreeMap::new(),
        metadata: BTreeMap::new(),
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

// ============ Sections ============

/// Parse a markdown heading line, returning its cleaned label.
fn heading_label(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let label = rest.trim().trim_end_matches('#').trim();
    if label.is_empty() {
        None
    } else {
        Some(label.to_string())
    }
}

fn first_heading(body: &str) -> Option<String> {
    body.lines().find_map(heading_label)
}

/// Split a body into `(label, text)` sections on headings outside code
/// fences. Text before the first heading is labelled with the title.
fn split_sections(body: &str, title: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut label = title.to_string();
    let mut buf: Vec<&str> = Vec::new();
    let mut in_code = false;

    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_code = !in_code;
        }
        if !in_code {
            if let Some(next) = heading_label(line) {
                push_section(&mut sections, &label, &buf);
                label = next;
                buf.clear();
                continue;
            }
        }
        buf.push(line);
    }
    push_section(&mut sections, &label, &buf);
    sections
}

fn push_section(sections: &mut Vec<(String, String)>, label: &str, lines: &[&str]) {
    let text = lines.join("\n");
    if !text.trim().is_empty() {
        sections.push((label.to_string(), text.trim().to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const LEGACY_CORPUS: &str = r#"---
id: clk-001
title: Lock timesheets
url: https://help.example.com/timesheets/lock-timesheets
tags: [timesheets, admin]
detected_lang: en
section_importance:
  Key points: high
---
# Lock timesheets

Admins can lock timesheets so past entries cannot change.

## Key points

Locked entries can only be edited by admins.

---
id: clk-legacy-404
title: Old page
url: https://help.example.com/old
---
This page no longer exists.

---
id: clk-002
title: Approvals
url: https://help.example.com/timesheets/approvals
tags: timesheets, approvals
status: deprecated
---
Deprecated approvals flow.
"#;

    fn corpus_config(suppressed: &[&str]) -> CorpusConfig {
        CorpusConfig {
            suppressed_ids: suppressed.iter().map(|s| s.to_string()).collect(),
            ..CorpusConfig::default()
        }
    }

    fn chunking() -> ChunkingConfig {
        ChunkingConfig {
            chunk_chars: 400,
            chunk_overlap: 50,
        }
    }

    #[test]
    fn test_knowledge_base_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("knowledge_base/track-time");
        fs::create_dir_all(&dir).unwrap();
        let article = dir.join("timesheet-view.md");
        fs::write(
            &article,
            "---\ntitle: \"Timesheet view\"\nurl: \"https://help.example.com/timesheet-view\"\ncategory: \"track-time\"\nslug: \"timesheet-view\"\n---\n\n## Timesheet view\n\nManagers can review their team's time in Timesheet view.\n",
        )
        .unwrap();
        fs::write(dir.join("notes.txt"), "ignored by include globs").unwrap();

        let out = ingest_path(
            &tmp.path().join("knowledge_base"),
            &CorpusConfig::default(),
            &chunking(),
        )
        .unwrap();

        assert_eq!(out.report.files, 1);
        let first = &out.chunks[0];
        assert_eq!(first.title, "Timesheet view");
        assert_eq!(first.url, "https://help.example.com/timesheet-view");
        assert_eq!(first.metadata["category"], "track-time");
        assert_eq!(first.metadata["slug"], "timesheet-view");
        assert_eq!(first.doc_path, article.to_string_lossy());
        assert!(first.text.starts_with("Context: Timesheet view"));
    }

    #[test]
    fn test_legacy_multi_article_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("help_corpus.en.md");
        fs::write(&path, LEGACY_CORPUS).unwrap();

        let out = ingest_path(&path, &corpus_config(&["clk-legacy-404"]), &chunking()).unwrap();

        assert_eq!(out.report.articles, 1);
        assert_eq!(out.report.suppressed, 2);
        assert!(out.chunks.iter().all(|c| c.article_id != "clk-legacy-404"));
        assert!(out.chunks.iter().all(|c| !c.section.starts_with('#')));

        let first = &out.chunks[0];
        assert_eq!(first.title, "Lock timesheets");
        assert_eq!(first.metadata["id"], "clk-001");
        assert_eq!(first.metadata["detected_lang"], "en");
        assert!(first.metadata["tags"]
            .as_array()
            .unwrap()
            .contains(&Value::String("timesheets".into())));
        assert_eq!(first.metadata["section_type"], first.section.as_str());

        let key_points = out
            .chunks
            .iter()
            .find(|c| c.metadata["section_type"] == "Key points")
            .unwrap();
        assert_eq!(key_points.metadata["section_importance"], "high");
    }

    #[test]
    fn test_broken_front_matter_skips_only_that_article() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("kb");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("a.md"),
            "---\ntitle: [unclosed\nurl: x\n---\nbody a\n",
        )
        .unwrap();
        fs::write(
            dir.join("b.md"),
            "---\ntitle: Good\nurl: https://help.example.com/good\n---\nGood body text.\n",
        )
        .unwrap();

        let out = ingest_path(&dir, &CorpusConfig::default(), &chunking()).unwrap();
        assert_eq!(out.report.failed, 1);
        assert!(matches!(
            out.report.errors[0],
            IngestError::FrontMatter { .. }
        ));
        assert_eq!(out.report.articles, 1);
        assert_eq!(out.chunks[0].title, "Good");
    }

    #[test]
    fn test_plain_markdown_without_front_matter() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("alpha.md");
        fs::write(&path, "# Alpha Document\n\nIntro.\n\n---\n\nAfter a rule.\n").unwrap();

        let out = ingest_path(&path, &CorpusConfig::default(), &chunking()).unwrap();
        assert_eq!(out.report.articles, 1);
        assert_eq!(out.chunks[0].title, "Alpha Document");
        assert!(out.chunks[0].url.starts_with("file://"));
        assert!(out.chunks[0].text.contains("After a rule."));
    }

    #[test]
    fn test_missing_corpus() {
        let err = ingest_path(
            Path::new("/nonexistent/kb"),
            &CorpusConfig::default(),
            &chunking(),
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::MissingCorpus(_)));
    }

    #[test]
    fn test_duplicate_urls_skipped() {
        let tmp = TempDir::new().unwrap();
        let doc = "---\ntitle: Same\nurl: https://help.example.com/same\n---\nText.\n";
        fs::write(tmp.path().join("a.md"), doc).unwrap();
        fs::write(tmp.path().join("b.md"), doc).unwrap();

        let out = ingest_path(tmp.path(), &CorpusConfig::default(), &chunking()).unwrap();
        assert_eq!(out.report.articles, 1);
        assert_eq!(out.report.duplicates, 1);
    }

    #[test]
    fn test_sections_ignore_headings_in_code() {
        let body = "Intro\n\n## Setup\n\n```bash\n# not a heading\n```\n\n### Done\nfin";
        let sections = split_sections(body, "Title");
        let labels: Vec<_> = sections.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["Title", "Setup", "Done"]);
        assert!(sections[1].1.contains("# not a heading"));
    }

    #[test]
    fn test_heading_label_cleaning() {
        assert_eq!(heading_label("## Key points ##").as_deref(), Some("Key points"));
        assert_eq!(heading_label("#hashtag"), None);
        assert_eq!(heading_label("plain"), None);
    }
}
