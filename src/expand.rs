//! Domain synonym and acronym expansion for the lexical query.
//!
//! Matching is whole-word and case-insensitive. The expanded query is the
//! original text followed by the synonyms of every matched term, so the
//! original wording always leads and BM25 still rewards exact matches.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::config::RetrievalConfig;
use crate::lexical::tokenize;

#[derive(Debug, Clone)]
pub struct QueryExpander {
    /// Lowercased single-word term → synonyms.
    terms: BTreeMap<String, Vec<String>>,
}

impl Default for QueryExpander {
    fn default() -> Self {
        let builtin: &[(&str, &[&str])] = &[
            ("track", &["log", "record", "enter", "add"]),
            ("time", &["hours", "duration"]),
            ("billable", &["chargeable", "invoiceable"]),
            ("sso", &["single sign-on", "saml", "login"]),
            ("report", &["summary", "analytics", "export"]),
            ("mobile", &["phone", "smartphone", "app"]),
            ("offline", &["no internet", "no connection"]),
            ("timesheet", &["time entries", "weekly view"]),
            ("approve", &["approval", "review", "submit"]),
            ("invoice", &["bill", "billing"]),
            ("rate", &["hourly rate", "cost"]),
            ("kiosk", &["pin", "clock in"]),
            ("pto", &["time off", "leave", "vacation"]),
            ("api", &["integration", "webhook"]),
        ];
        let terms = builtin
            .iter()
            .map(|(t, syns)| (t.to_string(), syns.iter().map(|s| s.to_string()).collect()))
            .collect();
        Self { terms }
    }
}

impl QueryExpander {
    pub fn new(terms: BTreeMap<String, Vec<String>>) -> Self {
        let terms = terms
            .into_iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        Self { terms }
    }

    /// Load a JSON object of `term -> [synonyms]`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read expansion file: {}", path.display()))?;
        let terms: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid expansion file: {}", path.display()))?;
        Ok(Self::new(terms))
    }

    /// The configured expander, or `None` when expansion is switched off.
    pub fn from_config(config: &RetrievalConfig) -> Result<Option<Self>> {
        if !config.expand_queries {
            return Ok(None);
        }
        match &config.expansion_file {
            Some(path) => Self::from_file(path).map(Some),
            None => Ok(Some(Self::default())),
        }
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn expand(&self, query: &str) -> String {
        if query.trim().is_empty() {
            return query.to_string();
        }

        let mut seen = HashSet::new();
        let mut extra: Vec<&str> = Vec::new();
        for word in tokenize(query) {
            if !seen.insert(word.clone()) {
                continue;
            }
            if let Some(syns) = self.terms.get(&word) {
                extra.extend(syns.iter().map(String::as_str));
            }
        }

        if extra.is_empty() {
            query.to_string()
        } else {
            format!("{} {}", query, extra.join(" "))
        }
    }
}
