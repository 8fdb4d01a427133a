//! Chat-completion collaborator.
//!
//! The engine talks to the model through [`InferenceInvoker`]; the shipped
//! implementation is [`OllamaChatClient`], which calls `POST /api/chat` with
//! streaming off and JSON output forced. Connect and read timeouts are set
//! separately so an unreachable host fails fast while a slow generation is
//! still allowed to finish.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::LlmConfig;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("cannot reach inference server at {url}: {message}")]
    Connect { url: String, message: String },

    #[error("inference timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("inference server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unreadable inference response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait InferenceInvoker: Send + Sync {
    fn model_name(&self) -> &str;
    /// Raw completion text for `messages`.
    async fn invoke(&self, messages: &[ChatMessage], temperature: f32) -> Result<String, InferenceError>;
}

pub struct OllamaChatClient {
    client: reqwest::Client,
    url: String,
    model: String,
    num_ctx: u32,
    num_predict: u32,
    read_timeout: Duration,
}

impl OllamaChatClient {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            num_ctx: config.num_ctx,
            num_predict: config.num_predict,
            read_timeout: config.read_timeout(),
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout(self.read_timeout)
        } else if e.is_connect() {
            InferenceError::Connect {
                url: self.url.clone(),
                message: e.to_string(),
            }
        } else {
            InferenceError::Decode(e.to_string())
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    format: &'a str,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_ctx: u32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[async_trait]
impl InferenceInvoker for OllamaChatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, messages: &[ChatMessage], temperature: f32) -> Result<String, InferenceError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            format: "json",
            options: ChatOptions {
                temperature,
                num_ctx: self.num_ctx,
                num_predict: self.num_predict,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let raw = response.text().await.map_err(|e| self.map_send_error(e))?;
        parse_chat_response(&raw)
    }
}

fn parse_chat_response(raw: &str) -> Result<String, InferenceError> {
    let parsed: ChatResponse =
        serde_json::from_str(raw).map_err(|e| InferenceError::Decode(e.to_string()))?;
    Ok(parsed.message.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let raw = r#"{"model":"m","message":{"role":"assistant","content":"{\"answer\":\"x\"}"},"done":true}"#;
        assert_eq!(parse_chat_response(raw).unwrap(), r#"{"answer":"x"}"#);
        assert!(matches!(
            parse_chat_response(r#"{"error":"model not found"}"#),
            Err(InferenceError::Decode(_))
        ));
    }

    #[test]
    fn test_request_shape() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("q")];
        let body = ChatRequest {
            model: "qwen",
            messages: &messages,
            stream: false,
            format: "json",
            options: ChatOptions {
                temperature: 0.0,
                num_ctx: 4096,
                num_predict: 256,
            },
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["stream"], false);
        assert_eq!(v["format"], "json");
        assert_eq!(v["messages"][1]["role"], "user");
        assert_eq!(v["options"]["num_ctx"], 4096);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connect_error() {
        let config = LlmConfig {
            url: "http://127.0.0.1:9".to_string(),
            connect_timeout_secs: 1.0,
            read_timeout_secs: 2.0,
            ..LlmConfig::default()
        };
        let client = OllamaChatClient::new(&config).unwrap();
        let err = client
            .invoke(&[ChatMessage::user("hi")], 0.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InferenceError::Connect { .. } | InferenceError::Timeout(_)
        ));
    }
}
