use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info_span, Instrument};

use super::handle::{DebugTransport, LazyHandle};
use super::openai::{self, OPENAI_BASE_URL};
use super::{param, structured, Client, Completion, ModelConfig, StreamResponse, StructuredResponse, ThinkingBlock, ThinkingType};
use crate::error::ClientError;
use crate::session::ChatSession;

/// OpenAI reasoning models (o-series). They take instructions as a
/// `developer` message, count output with `max_completion_tokens` and reject
/// the sampling parameters.
pub struct OpenAiReasoningClient {
    handle: LazyHandle,
    base_url: String,
}

impl OpenAiReasoningClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, OPENAI_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            handle: LazyHandle::new("openai-reasoning", api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn build_body(&self, session: &ChatSession, config: &ModelConfig, stream: bool) -> Value {
        let mut body = json!({
            "model": &config.base_model,
            "messages": openai::chat_messages(session, "developer"),
            "stream": stream,
        });

        if let Some(max) = config.int(param::MAX_TOKENS) {
            body["max_completion_tokens"] = json!(max);
        }
        if let Some(effort) = config.string(param::REASONING_EFFORT) {
            body["reasoning_effort"] = json!(effort);
        }
        body
    }

    async fn complete(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<Completion, ClientError> {
        let body = self.build_body(session, config, false);
        let mut completion = openai::complete(&self.handle, &self.base_url, &body)
            .instrument(info_span!("openai_reasoning_chat", model = %config.base_model))
            .await?;

        // The API keeps the trace itself private; report what was spent on it.
        if let Some(effort) = config.string(param::REASONING_EFFORT) {
            let tokens = completion
                .metadata
                .get("usage")
                .and_then(|u| u["completion_tokens_details"]["reasoning_tokens"].as_u64());

            let summary = match tokens {
                Some(n) => format!("Reasoned with {effort} effort using {n} reasoning tokens."),
                None => format!("Reasoned with {effort} effort."),
            };
            completion
                .thinking
                .push(ThinkingBlock::new(self.provider_id(), ThinkingType::Reasoning, summary));
        }

        Ok(completion)
    }
}

#[async_trait]
impl Client for OpenAiReasoningClient {
    fn provider_id(&self) -> &str {
        self.handle.provider()
    }

    fn is_configured(&self) -> bool {
        self.handle.is_configured()
    }

    async fn send_chat_completion(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<String, ClientError> {
        self.complete(session, config).await?.into_text(self.provider_id())
    }

    async fn stream_chat_completion(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<StreamResponse, ClientError> {
        openai::stream(&self.handle, &self.base_url, &self.build_body(session, config, true))
    }

    async fn send_structured_completion(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> StructuredResponse {
        structured(self.provider_id(), self.complete(session, config).await)
    }

    fn set_debug_transport(&self, transport: Option<Arc<dyn DebugTransport>>) {
        self.handle.set_debug_transport(transport)
    }
}
