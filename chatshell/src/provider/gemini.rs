use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, info_span, Instrument};

use super::handle::{DebugTransport, LazyHandle};
use super::sse::SseAction;
use super::{param, structured, Client, Completion, ModelConfig, StreamResponse, StructuredResponse, ThinkingBlock, ThinkingType};
use crate::error::ClientError;
use crate::session::{ChatSession, Role};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    handle: LazyHandle,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, GEMINI_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            handle: LazyHandle::new("gemini", api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn build_body(&self, session: &ChatSession, config: &ModelConfig) -> Value {
        let mut contents = Vec::with_capacity(session.messages.len());
        for m in session.messages() {
            let role = match m.role {
                Role::User | Role::System => "user",
                Role::Assistant => "model",
                Role::Unknown => {
                    debug!(message_id = %m.id, "Skipping message with unknown role");
                    continue;
                }
            };
            contents.push(json!({ "role": role, "parts": [{ "text": &m.content }] }));
        }

        if contents.is_empty() {
            contents.push(json!({ "role": "user", "parts": [{ "text": "" }] }));
        }

        let mut body = json!({ "contents": contents });
        if !session.system_prompt.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": &session.system_prompt }] });
        }

        let mut generation = Map::new();
        if let Some(t) = config.float(param::TEMPERATURE) {
            generation.insert("temperature".to_string(), json!(t));
        }
        if let Some(max) = config.int(param::MAX_TOKENS) {
            generation.insert("maxOutputTokens".to_string(), json!(max));
        }
        if let Some(p) = config.float(param::TOP_P) {
            generation.insert("topP".to_string(), json!(p));
        }
        if let Some(k) = config.int(param::TOP_K) {
            generation.insert("topK".to_string(), json!(k));
        }
        if let Some(budget) = config.int(param::THINKING_BUDGET) {
            generation.insert(
                "thinkingConfig".to_string(),
                json!({ "thinkingBudget": budget, "includeThoughts": budget != 0 }),
            );
        }

        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        body
    }

    async fn complete(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<Completion, ClientError> {
        let vendor = self.handle.get()?;
        let url = format!("{}/models/{}:generateContent", self.base_url, config.base_model);
        let body = self.build_body(session, config);

        info!(model = %config.base_model, "Generating content");
        let request = vendor.post(&url).header("x-goog-api-key", self.handle.api_key());
        let reply = vendor
            .send_json(request, &url, &body)
            .instrument(info_span!("gemini_generate", model = %config.base_model))
            .await?;

        parse_response(self.provider_id(), &reply)
    }
}

/// Parts of the first candidate, split on the `thought` flag.
fn split_parts(provider: &str, body: &Value) -> (String, Vec<ThinkingBlock>) {
    let mut text = String::new();
    let mut thinking = Vec::new();

    let parts = body["candidates"][0]["content"]["parts"].as_array();
    for part in parts.into_iter().flatten() {
        let Some(t) = part["text"].as_str() else {
            continue;
        };
        if part["thought"].as_bool().unwrap_or(false) {
            thinking.push(ThinkingBlock::new(provider, ThinkingType::Thinking, t));
        } else {
            text.push_str(t);
        }
    }

    (text, thinking)
}

fn parse_response(provider: &str, body: &Value) -> Result<Completion, ClientError> {
    if body["candidates"].as_array().map_or(true, |c| c.is_empty()) {
        let reason = body["promptFeedback"]["blockReason"]
            .as_str()
            .map(|r| format!("no candidates, prompt blocked: {r}"))
            .unwrap_or_else(|| "no candidates".to_string());
        return Err(ClientError::response_format(provider, reason));
    }

    let (text, thinking) = split_parts(provider, body);

    let mut metadata = Map::new();
    if let Some(reason) = body["candidates"][0]["finishReason"].as_str() {
        metadata.insert("finish_reason".to_string(), json!(reason));
    }
    for (key, name) in [("usageMetadata", "usage"), ("modelVersion", "model")] {
        if !body[key].is_null() {
            metadata.insert(name.to_string(), body[key].clone());
        }
    }

    Ok(Completion {
        text,
        thinking,
        metadata,
    })
}

/// Each `streamGenerateContent` event is a full response fragment; thoughts
/// are not forwarded.
fn parse_stream_event(provider: &str, data: &str) -> SseAction {
    let chunk: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return SseAction::Fail(ClientError::response_format(provider, format!("stream chunk: {e}"))),
    };

    if let Some(message) = chunk["error"]["message"].as_str() {
        return SseAction::Fail(ClientError::Api {
            provider: provider.to_string(),
            code: chunk["error"]["status"].as_str().unwrap_or("stream_error").to_string(),
            message: message.to_string(),
        });
    }

    let (text, _) = split_parts(provider, &chunk);
    SseAction::Emit(text)
}

#[async_trait]
impl Client for GeminiClient {
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
        let vendor = self.handle.get()?;
        let url = format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, config.base_model);
        let body = self.build_body(session, config);

        info!(model = %config.base_model, "Starting stream");
        let request = vendor.post(&url).header("x-goog-api-key", self.handle.api_key());

        let provider = self.provider_id().to_string();
        vendor.stream(request, &url, &body, move |_, data| parse_stream_event(&provider, data))
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
