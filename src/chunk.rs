//! Character-window chunker with overlap.
//!
//! Each section body is cut into windows of at most `chunk_chars`
//! characters. Consecutive windows share `overlap` characters; a window end
//! is pulled back to the nearest whitespace in its second half so words are
//! not split. Chunk ids are derived from the article key, section ordinal and
//! window ordinal, so unchanged input always produces the same ids.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::models::Chunk;

/// Approximate chars-per-token ratio shared with the packer's tokenizer.
pub const CHARS_PER_TOKEN: usize = 4;

/// Article-level fields copied onto every chunk.
#[derive(Debug, Clone)]
pub struct ArticleInfo<'a> {
    pub article_id: &'a str,
    pub title: &'a str,
    pub url: &'a str,
    pub doc_path: &'a str,
}

/// Split `text` into overlapping windows of at most `size` characters.
///
/// `overlap` is clamped below `size`. Empty or whitespace-only input yields
/// no windows.
pub fn split_windows(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let overlap = overlap.min(size - 1);

    // byte offset of every char boundary, including the end
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n_chars = bounds.len() - 1;

    if text.trim().is_empty() {
        return Vec::new();
    }
    if n_chars <= size {
        return vec![text.trim().to_string()];
    }

    let mut windows = Vec::new();
    let mut start = 0usize;
    loop {
        let mut end = (start + size).min(n_chars);
        if end < n_chars {
            end = snap_to_whitespace(text, &bounds, start + size / 2, end);
        }

        let piece = text[bounds[start]..bounds[end]].trim();
        if !piece.is_empty() {
            windows.push(piece.to_string());
        }
        if end >= n_chars {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    windows
}

/// Latest char position in `(floor, end]` that follows whitespace, or `end`.
fn snap_to_whitespace(text: &str, bounds: &[usize], floor: usize, end: usize) -> usize {
    let window = &text[bounds[floor]..bounds[end]];
    match window.rfind(char::is_whitespace) {
        Some(byte_pos) => {
            let absolute = bounds[floor] + byte_pos;
            // char index just past the whitespace char
            let idx = bounds.partition_point(|b| *b <= absolute);
            if idx > floor {
                idx
            } else {
                end
            }
        }
        None => end,
    }
}

/// Build the chunks for one section of an article.
pub fn chunk_section(
    article: &ArticleInfo<'_>,
    section: &str,
    section_ordinal: usize,
    body: &str,
    size: usize,
    overlap: usize,
    metadata: &BTreeMap<String, Value>,
) -> Vec<Chunk> {
    let header = context_header(article.title, section);
    split_windows(body, size, overlap)
        .into_iter()
        .enumerate()
        .map(|(window, piece)| Chunk {
            id: chunk_id(article.url, section_ordinal, window),
            article_id: article.article_id.to_string(),
            title: article.title.to_string(),
            url: article.url.to_string(),
            section: section.to_string(),
            text: format!("{}\n\n{}", header, piece),
            doc_path: article.doc_path.to_string(),
            metadata: metadata.clone(),
        })
        .collect()
}

pub fn context_header(title: &str, section: &str) -> String {
    if section.is_empty() || section == title {
        format!("Context: {}", title)
    } else {
        format!("Context: {} > {}", title, section)
    }
}

fn chunk_id(article_key: &str, section_ordinal: usize, window: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(article_key.as_bytes());
    hasher.update([0x1f]);
    hasher.update(section_ordinal.to_le_bytes());
    hasher.update(window.to_le_bytes());
    let digest = hasher.finalize();
    format!("c-{}", hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article() -> ArticleInfo<'static> {
        ArticleInfo {
            article_id: "clk-001",
            title: "Lock timesheets",
            url: "https://help.example.com/lock-timesheets",
            doc_path: "kb/lock.md",
        }
    }

    #[test]
    fn test_short_text_single_window() {
        let w = split_windows("Hello, world!", 100, 10);
        assert_eq!(w, vec!["Hello, world!"]);
    }

    #[test]
    fn test_empty_text() {
        assert!(split_windows("", 100, 10).is_empty());
        assert!(split_windows("  \n ", 100, 10).is_empty());
    }

    #[test]
    fn test_windows_respect_size() {
        let text = (0..200)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let windows = split_windows(&text, 120, 20);
        assert!(windows.len() > 1);
        for w in &windows {
            assert!(w.chars().count() <= 120, "window too long: {}", w.len());
        }
    }

    #[test]
    fn test_windows_overlap() {
        let text = (0..100)
            .map(|i| format!("w{:03}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let windows = split_windows(&text, 60, 20);
        for pair in windows.windows(2) {
            let last_word = pair[0].split_whitespace().last().unwrap();
            assert!(
                pair[1].contains(last_word),
                "expected '{}' repeated in next window",
                last_word
            );
        }
    }

    #[test]
    fn test_overlap_clamped() {
        // overlap >= size must still terminate and cover the text
        let text = "abcdefghij".repeat(5);
        let windows = split_windows(&text, 10, 50);
        assert!(!windows.is_empty());
        assert!(windows.last().unwrap().ends_with('j'));
    }

    #[test]
    fn test_multibyte_text() {
        let text = "时间跟踪 chronomètre ".repeat(40);
        let windows = split_windows(&text, 50, 10);
        assert!(windows.len() > 1);
        for w in &windows {
            assert!(w.chars().count() <= 50);
        }
    }

    #[test]
    fn test_chunk_section_header_and_ids() {
        let meta = BTreeMap::new();
        let chunks = chunk_section(&article(), "Key points", 1, "Admins can lock.", 100, 10, &meta);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0]
            .text
            .starts_with("Context: Lock timesheets > Key points\n\n"));
        assert!(chunks[0].id.starts_with("c-"));

        let same_title = chunk_section(&article(), "Lock timesheets", 0, "x", 100, 10, &meta);
        assert!(same_title[0].text.starts_with("Context: Lock timesheets\n\n"));
    }

    #[test]
    fn test_deterministic_ids() {
        let meta = BTreeMap::new();
        let body = "alpha beta gamma ".repeat(30);
        let a = chunk_section(&article(), "S", 2, &body, 80, 10, &meta);
        let b = chunk_section(&article(), "S", 2, &body, 80, 10, &meta);
        assert_eq!(a, b);
        let ids: std::collections::HashSet<_> = a.iter().map(|c| &c.id).collect();
        assert_eq!(ids.len(), a.len());
    }
}
