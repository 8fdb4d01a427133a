//! Strict validator for the model's structured answer.
//!
//! The model is instructed to reply with a single JSON object:
//!
//! ```json
//! { "answer": "...", "confidence": 0-100, "reasoning": "...", "sources_used": ["1", "3"] }
//! ```
//!
//! Surrounding Markdown code fences are tolerated, with or without the
//! closing fence. Unknown fields are ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const REQUIRED_FIELDS: [&str; 4] = ["answer", "confidence", "reasoning", "sources_used"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedAnswer {
    pub answer: String,
    pub confidence: u8,
    pub reasoning: String,
    pub sources_used: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnswerContractError {
    #[error("Invalid JSON: {0}")]
    Parse(String),

    #[error("Expected JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Field '{field}' must be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("Field 'confidence' must be in range 0-100, got {0}")]
    ConfidenceOutOfRange(i64),

    #[error("Field 'answer' must not be empty")]
    EmptyAnswer,

    #[error("Field 'sources_used[{0}]' must not be empty")]
    EmptySource(usize),
}

/// Parse and validate raw model output.
pub fn parse_answer(raw: &str) -> Result<ValidatedAnswer, AnswerContractError> {
    let body = strip_code_fences(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|e| AnswerContractError::Parse(e.to_string()))?;

    let obj = match &value {
        Value::Object(map) => map,
        other => return Err(AnswerContractError::NotAnObject(json_type_name(other))),
    };

    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|f| !obj.contains_key(**f))
        .map(|f| f.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(AnswerContractError::MissingFields(missing));
    }

    let answer = string_field(obj, "answer")?;
    if answer.trim().is_empty() {
        return Err(AnswerContractError::EmptyAnswer);
    }
    let confidence = confidence_field(obj)?;
    let reasoning = string_field(obj, "reasoning")?;
    let sources_used = sources_field(obj)?;

    Ok(ValidatedAnswer {
        answer,
        confidence,
        reasoning,
        sources_used,
    })
}

/// Remove a leading ```` ``` ```` / ```` ```json ```` line and an optional
/// trailing fence.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
        text = text.trim();
        if let Some(inner) = text.strip_suffix("```") {
            text = inner.trim();
        }
    }
    text
}

fn string_field(obj: &Map<String, Value>, field: &str) -> Result<String, AnswerContractError> {
    match obj.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(AnswerContractError::WrongType {
            field: field.to_string(),
            expected: "string",
        }),
    }
}

fn confidence_field(obj: &Map<String, Value>) -> Result<u8, AnswerContractError> {
    let wrong_type = || AnswerContractError::WrongType {
        field: "confidence".to_string(),
        expected: "integer",
    };

    let n = match obj.get("confidence") {
        Some(Value::Number(n)) => n,
        _ => return Err(wrong_type()),
    };

    let value = if let Some(i) = n.as_i64() {
        i
    } else if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            return Err(wrong_type());
        }
        // `as` saturates, so huge values still land out of range
        f.trunc() as i64
    } else {
        return Err(wrong_type());
    };

    u8::try_from(value)
        .ok()
        .filter(|v| *v <= 100)
        .ok_or(AnswerContractError::ConfidenceOutOfRange(value))
}

fn sources_field(obj: &Map<String, Value>) -> Result<Vec<String>, AnswerContractError> {
    let items = match obj.get("sources_used") {
        Some(Value::Array(items)) => items,
        _ => {
            return Err(AnswerContractError::WrongType {
                field: "sources_used".to_string(),
                expected: "list",
            })
        }
    };

    let mut sources = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match item {
            Value::String(s) if s.trim().is_empty() => {
                return Err(AnswerContractError::EmptySource(i))
            }
            Value::String(s) => sources.push(s.trim().to_string()),
            _ => {
                return Err(AnswerContractError::WrongType {
                    field: format!("sources_used[{}]", i),
                    expected: "string",
                })
            }
        }
    }
    Ok(sources)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
