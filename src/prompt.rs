//! Message templates for the answer model.

use crate::llm::ChatMessage;
use crate::models::PackedContext;

pub const SYSTEM_PROMPT: &str = r#"You are an internal support assistant. Agents paste your replies to customers with minimal edits.

Ground every statement in the CONTEXT_BLOCKs supplied with the question. Plain general software knowledge (what a browser or a CSV file is) is fine; undocumented product behaviour, settings, API fields or ticket numbers are not. When the blocks do not cover the question, say so and suggest a safe next step such as checking a workspace setting or escalating.

Be concise and practical. Lead with a one or two sentence summary, then numbered steps where a procedure is involved. Reply in the language of the question. Never mention that you are a model.

Respond with a single JSON object and nothing else:
{
  "answer": "customer-ready reply",
  "confidence": 0-100 integer, how well the blocks support the answer,
  "reasoning": "one or two sentences on which blocks were used and why",
  "sources_used": ["block id numbers you relied on, e.g. \"1\", \"3\""]
}"#;

pub fn user_prompt(question: &str, packed: &PackedContext) -> String {
    format!(
        "CONTEXT_BLOCKS\n====================\n{}\n====================\n\n\
         QUESTION\n====================\n{}\n====================\n\n\
         Answer using only the context above and cite the block ids you used in sources_used.",
        packed.text,
        question.trim()
    )
}

pub fn messages(question: &str, packed: &PackedContext) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(user_prompt(question, packed)),
    ]
}

/// Follow-up turn after a reply that broke the JSON contract.
pub fn corrective_messages(base: &[ChatMessage], bad_reply: &str, problem: &str) -> Vec<ChatMessage> {
    let mut out = base.to_vec();
    out.push(ChatMessage::assistant(bad_reply));
    out.push(ChatMessage::user(format!(
        "Your previous reply was rejected: {}. Reply again with only the JSON object \
         containing answer, confidence (integer 0-100), reasoning and sources_used.",
        problem
    )));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed() -> PackedContext {
        PackedContext {
            chunk_ids: vec!["c1".into()],
            indices: vec![0],
            text: "[CONTEXT_BLOCK id=1]\nsource: u\nLocked entries are read-only.".into(),
            tokens_used: 12,
        }
    }

    #[test]
    fn test_user_prompt_contains_context_and_question() {
        let p = user_prompt("  Can I edit a locked entry? ", &packed());
        assert!(p.contains("[CONTEXT_BLOCK id=1]"));
        assert!(p.contains("QUESTION\n====================\nCan I edit a locked entry?\n"));
    }

    #[test]
    fn test_messages_roles() {
        let m = messages("q", &packed());
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].role, "system");
        assert!(m[0].content.contains("sources_used"));
        assert_eq!(m[1].role, "user");
    }

    #[test]
    fn test_corrective_appends_two_turns() {
        let base = messages("q", &packed());
        let c = corrective_messages(&base, "not json", "Invalid JSON: expected value");
        assert_eq!(c.len(), 4);
        assert_eq!(c[2].role, "assistant");
        assert_eq!(c[2].content, "not json");
        assert!(c[3].content.contains("Invalid JSON"));
    }
}
