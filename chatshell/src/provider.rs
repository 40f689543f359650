use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{ClientError, ErrorType, LlmError};
use crate::session::ChatSession;

pub mod anthropic;
pub mod compatible;
pub mod gemini;
pub mod handle;
pub mod mock;
pub mod openai;
pub mod reasoning;
pub(crate) mod sse;

pub use handle::{DebugTransport, TracingTransport};

/// Parameter keys understood by at least one adapter.
pub mod param {
    pub const TEMPERATURE: &str = "temperature";
    pub const MAX_TOKENS: &str = "max_tokens";
    pub const TOP_P: &str = "top_p";
    pub const FREQUENCY_PENALTY: &str = "frequency_penalty";
    pub const PRESENCE_PENALTY: &str = "presence_penalty";
    pub const TOP_K: &str = "top_k";
    pub const REASONING_EFFORT: &str = "reasoning_effort";
    pub const THINKING_BUDGET: &str = "thinking_budget";
}

/// Model selection plus free-form parameters. Adapters read the keys they
/// support and ignore the rest, including values of the wrong type.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub base_model: String,
    pub provider: String,
    #[serde(rename = "catalogID", default)]
    pub catalog_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl ModelConfig {
    pub fn new<P: Into<String>, M: Into<String>>(provider: P, base_model: M) -> Self {
        Self {
            base_model: base_model.into(),
            provider: provider.into(),
            ..Self::default()
        }
    }

    pub fn with_param<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        self.parameters.get(key)?.as_f64()
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.parameters.get(key)?.as_i64()
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)?
            .as_str()
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingType {
    Thinking,
    RedactedThinking,
    Reasoning,
}

/// Provider-internal reasoning, kept apart from the visible answer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ThinkingBlock {
    pub content: String,
    pub provider: String,
    #[serde(rename = "type")]
    pub kind: ThinkingType,
}

impl ThinkingBlock {
    pub fn new<C: Into<String>>(provider: &str, kind: ThinkingType, content: C) -> Self {
        Self {
            content: content.into(),
            provider: provider.to_string(),
            kind,
        }
    }
}

/// Result of a structured completion. Failures are carried in `error`, so a
/// caller can still show whatever text or thinking arrived.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StructuredResponse {
    pub text_content: String,
    pub thinking_blocks: Vec<ThinkingBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LlmError>,
    pub metadata: Map<String, Value>,
}

impl StructuredResponse {
    pub fn failed<E: Into<LlmError>>(error: E) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// One piece of a streamed reply. The last chunk of a stream has
/// `done = true` and may carry the error that ended it.
#[derive(Debug)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    pub error: Option<ClientError>,
}

impl StreamChunk {
    pub fn content<T: Into<String>>(content: T) -> Self {
        Self {
            content: content.into(),
            done: false,
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            content: String::new(),
            done: true,
            error: None,
        }
    }

    pub fn failed(error: ClientError) -> Self {
        Self {
            error: Some(error),
            ..Self::done()
        }
    }
}

/// Receiving end of a streamed completion. Dropping it stops the producer.
pub struct StreamResponse {
    pub meta: Value,
    pub rx: mpsc::Receiver<StreamChunk>,
    finished: bool,
}

impl StreamResponse {
    pub fn new(meta: Value, rx: mpsc::Receiver<StreamChunk>) -> Self {
        Self {
            meta,
            rx,
            finished: false,
        }
    }

    /// Next chunk, or `None` once the terminal chunk has been returned.
    pub async fn next(&mut self) -> Option<StreamChunk> {
        if self.finished {
            return None;
        }

        let chunk = self.rx.recv().await.unwrap_or_else(|| {
            StreamChunk::failed(ClientError::Stream("stream closed without a terminal chunk".to_string()))
        });

        if chunk.done {
            self.finished = true;
            self.rx.close();
        }
        Some(chunk)
    }

    /// Drains the stream into one string, failing if the stream ended with an
    /// error.
    pub async fn collect_text(mut self) -> Result<String, ClientError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk.content);
            if let Some(err) = chunk.error {
                return Err(err);
            }
        }
        Ok(text)
    }
}

/// The uniform contract every provider adapter implements.
#[async_trait]
pub trait Client: Send + Sync {
    /// Stable lowercase provider identity, e.g. `"anthropic"`.
    fn provider_id(&self) -> &str;

    /// True when a credential is present. Says nothing about its validity.
    fn is_configured(&self) -> bool;

    async fn send_chat_completion(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<String, ClientError>;

    async fn stream_chat_completion(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<StreamResponse, ClientError>;

    /// Never fails outright; see [`StructuredResponse`].
    async fn send_structured_completion(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> StructuredResponse;

    /// Installs (or removes) a request/response observer. The vendor handle
    /// is rebuilt on the next call.
    fn set_debug_transport(&self, transport: Option<Arc<dyn DebugTransport>>);
}

/// What an adapter extracted from one non-streaming exchange.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    pub text: String,
    pub thinking: Vec<ThinkingBlock>,
    pub metadata: Map<String, Value>,
}

impl Completion {
    pub fn into_text(self, provider: &str) -> Result<String, ClientError> {
        if self.text.is_empty() {
            return Err(ClientError::EmptyResponse(provider.to_string()));
        }
        Ok(self.text)
    }

    pub fn into_structured(self, provider: &str) -> StructuredResponse {
        let error = self.text.is_empty().then(|| {
            LlmError::new(
                "empty_response",
                format!("{provider} returned empty response content"),
                ErrorType::ResponseError,
            )
        });

        StructuredResponse {
            text_content: self.text,
            thinking_blocks: self.thinking,
            error,
            metadata: self.metadata,
        }
    }
}

/// Shared tail of `send_structured_completion` for HTTP adapters.
pub(crate) fn structured(
    provider: &str,
    result: Result<Completion, ClientError>,
) -> StructuredResponse {
    let mut response = match result {
        Ok(completion) => completion.into_structured(provider),
        Err(e) => StructuredResponse::failed(e),
    };
    response
        .metadata
        .insert("provider".to_string(), Value::String(provider.to_string()));
    response
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn params_ignore_wrong_types() {
        let config = ModelConfig::new("openai", "gpt-4o")
            .with_param(param::TEMPERATURE, "hot")
            .with_param(param::MAX_TOKENS, 1.5)
            .with_param(param::TOP_P, 1)
            .with_param(param::REASONING_EFFORT, "  ");

        assert_eq!(config.float(param::TEMPERATURE), None);
        assert_eq!(config.int(param::MAX_TOKENS), None);
        assert_eq!(config.float(param::TOP_P), Some(1.0));
        assert_eq!(config.string(param::REASONING_EFFORT), None);
        assert_eq!(config.int("missing"), None);
    }

    #[test]
    fn model_config_json_shape() {
        let config: ModelConfig = serde_json::from_value(json!({
            "baseModel": "claude-sonnet-4",
            "provider": "anthropic",
            "catalogID": "sonnet",
            "parameters": {"max_tokens": 512}
        }))
        .unwrap();

        assert_eq!(config.catalog_id, "sonnet");
        assert_eq!(config.int(param::MAX_TOKENS), Some(512));
        assert!(config.description.is_empty());
    }

    #[test]
    fn empty_completion_is_an_error_both_ways() {
        let err = Completion::default().into_text("gemini").unwrap_err();
        assert_eq!(err.to_string(), "gemini returned empty response content");

        let response = structured("gemini", Ok(Completion::default()));
        assert_eq!(response.error.unwrap().code, "empty_response");
        assert_eq!(response.metadata["provider"], "gemini");
    }

    #[test]
    fn structured_serializes_type_tags() {
        let response = StructuredResponse {
            text_content: "hi".into(),
            thinking_blocks: vec![ThinkingBlock::new("anthropic", ThinkingType::RedactedThinking, "[redacted]")],
            ..StructuredResponse::default()
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["thinkingBlocks"][0]["type"], "redacted_thinking");
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn stream_stops_after_terminal_chunk() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamChunk::content("a")).await.unwrap();
        tx.send(StreamChunk::content("b")).await.unwrap();
        tx.send(StreamChunk::done()).await.unwrap();
        let _ = tx.send(StreamChunk::content("late")).await;

        let mut stream = StreamResponse::new(json!({}), rx);
        let mut seen = Vec::new();
        while let Some(chunk) = stream.next().await {
            seen.push((chunk.content, chunk.done));
        }

        assert_eq!(seen, vec![("a".into(), false), ("b".into(), false), (String::new(), true)]);
    }

    #[tokio::test]
    async fn closed_channel_still_yields_terminal_chunk() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamChunk::content("partial")).await.unwrap();
        drop(tx);

        let result = StreamResponse::new(json!({}), rx).collect_text().await;
        assert!(matches!(result, Err(ClientError::Stream(_))));
    }
}
