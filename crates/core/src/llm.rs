//! OpenAI-compatible chat client.
//!
//! `LlmClient` is the substitution seam: the engine depends on the trait,
//! not on `reqwest` or any particular vendor. `OpenAiChat` is the one real
//! implementation, talking to `POST {base_url}/chat/completions` the way
//! the teacher's HTTP-backed collaborators do (compare the embeddings
//! client in the `retrieval` pack this crate also draws on).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::LlmUsage;
use crate::error::{EngineError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// A chat completion response, normalized from either streaming or
/// non-streaming transport.
#[derive(Clone, Debug, Default)]
pub struct ChatResponse {
    pub content: String,
    pub role: String,
    pub usage: Option<LlmUsage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    /// `total_tokens`, falling back to `prompt + completion` when the
    /// upstream response omits the aggregate field.
    pub fn total_tokens(&self) -> u32 {
        match &self.usage {
            Some(u) if u.total_tokens > 0 => u.total_tokens,
            Some(u) => u.prompt_tokens + u.completion_tokens,
            None => 0,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, messages: &[Message]) -> Result<ChatResponse>;
}

/// Non-streaming OpenAI-compatible chat client. The ReAct loop always calls
/// with `stream=false` so it can react to a complete response.
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<LlmUsage>,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAiChat {
    async fn chat(&self, messages: &[Message]) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let request = ChatRequest { model: &self.model, messages, stream: false };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::LlmTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::LlmTransport(format!("HTTP {status}: {body}")));
        }

        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| EngineError::LlmResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::LlmResponse("empty choices array".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            role: if choice.message.role.is_empty() { "assistant".to_string() } else { choice.message.role },
            usage: parsed.usage,
            model: parsed.model,
            finish_reason: choice.finish_reason,
        })
    }
}

/// Extract a JSON value from a tagged region of LLM output, e.g. `<NAME>...</NAME>`.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].trim().to_string())
}

/// Best-effort JSON array parse for prompts that ask the LLM to return
/// `[{...}, ...]`, tolerating a wrapping ```json fenced block.
pub fn parse_json_array(text: &str) -> Option<Vec<Value>> {
    let candidate = strip_code_fence(text);
    serde_json::from_str::<Value>(candidate.trim())
        .ok()
        .and_then(|v| v.as_array().cloned())
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_tag_finds_content() {
        let text = "blah <NAME>Foo Bar</NAME> blah";
        assert_eq!(extract_tag(text, "NAME").as_deref(), Some("Foo Bar"));
    }

    #[test]
    fn extract_tag_missing_returns_none() {
        assert!(extract_tag("no tags here", "NAME").is_none());
    }

    #[test]
    fn parse_json_array_strips_fence() {
        let text = "```json\n[{\"path\": \"a\"}]\n```";
        let arr = parse_json_array(text).unwrap();
        assert_eq!(arr.len(), 1);
    }

    #[test]
    fn total_tokens_falls_back_to_prompt_plus_completion() {
        let resp = ChatResponse {
            usage: Some(LlmUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 0 }),
            ..Default::default()
        };
        assert_eq!(resp.total_tokens(), 15);
    }
}
