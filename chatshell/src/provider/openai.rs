use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info_span, Instrument};

use super::handle::{DebugTransport, LazyHandle};
use super::sse::SseAction;
use super::{param, structured, Client, Completion, ModelConfig, StreamResponse, StructuredResponse};
use crate::error::ClientError;
use crate::session::{ChatSession, Role};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Sampling parameters the standard chat-completions endpoint accepts.
pub(crate) const SAMPLING_PARAMS: [&str; 4] = [
    param::TEMPERATURE,
    param::TOP_P,
    param::FREQUENCY_PENALTY,
    param::PRESENCE_PENALTY,
];

/// Chat-completions `messages` for a session. The system prompt leads under
/// `system_role`; unknown roles are dropped; an empty conversation becomes a
/// single empty user message.
pub(crate) fn chat_messages(session: &ChatSession, system_role: &str) -> Vec<Value> {
    let mut out = Vec::with_capacity(session.messages.len() + 1);
    if !session.system_prompt.is_empty() {
        out.push(json!({ "role": system_role, "content": &session.system_prompt }));
    }

    for m in session.messages() {
        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => system_role,
            Role::Unknown => {
                debug!(message_id = %m.id, "Skipping message with unknown role");
                continue;
            }
        };
        out.push(json!({ "role": role, "content": &m.content }));
    }

    if out.is_empty() {
        out.push(json!({ "role": "user", "content": "" }));
    }
    out
}

/// Copies the float parameters named in `keys` into `body`.
pub(crate) fn apply_floats(body: &mut Value, config: &ModelConfig, keys: &[&str]) {
    for key in keys {
        if let Some(v) = config.float(key) {
            body[*key] = json!(v);
        }
    }
}

/// Request body shared by OpenAI and the OpenAI-compatible vendors.
pub(crate) fn chat_body(session: &ChatSession, config: &ModelConfig, stream: bool) -> Value {
    let mut body = json!({
        "model": &config.base_model,
        "messages": chat_messages(session, "system"),
        "stream": stream,
    });

    apply_floats(&mut body, config, &SAMPLING_PARAMS);
    if let Some(max) = config.int(param::MAX_TOKENS) {
        body["max_tokens"] = json!(max);
    }
    body
}

/// Text and metadata from a chat-completions reply.
pub(crate) fn parse_completion(provider: &str, body: &Value) -> Result<Completion, ClientError> {
    let choice = body["choices"]
        .as_array()
        .and_then(|c| c.first())
        .ok_or_else(|| ClientError::response_format(provider, "response has no choices"))?;

    let text = choice["message"]["content"].as_str().unwrap_or_default().to_string();

    let mut metadata = Map::new();
    for key in ["id", "model", "usage"] {
        if !body[key].is_null() {
            metadata.insert(key.to_string(), body[key].clone());
        }
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        metadata.insert("finish_reason".to_string(), json!(reason));
    }

    Ok(Completion {
        text,
        metadata,
        ..Completion::default()
    })
}

/// Maps one chat-completions SSE event to a stream action.
pub(crate) fn parse_stream_event(provider: &str, data: &str) -> SseAction {
    if data.trim() == "[DONE]" {
        return SseAction::Done;
    }

    let chunk: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return SseAction::Fail(ClientError::response_format(provider, format!("stream chunk: {e}"))),
    };

    if let Some(message) = chunk["error"]["message"].as_str() {
        let code = chunk["error"]["code"].as_str().unwrap_or("stream_error");
        return SseAction::Fail(ClientError::Api {
            provider: provider.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    match chunk["choices"][0]["delta"]["content"].as_str() {
        Some(text) => SseAction::Emit(text.to_string()),
        None => SseAction::Skip,
    }
}

/// Sends a prepared chat-completions body and parses the reply.
pub(crate) async fn complete(
    handle: &LazyHandle,
    base_url: &str,
    body: &Value,
) -> Result<Completion, ClientError> {
    let vendor = handle.get()?;
    let url = format!("{base_url}/chat/completions");
    let request = vendor.post(&url).bearer_auth(handle.api_key());

    let reply = vendor.send_json(request, &url, body).await?;
    parse_completion(handle.provider(), &reply)
}

/// Opens a chat-completions stream for a prepared body.
pub(crate) fn stream(
    handle: &LazyHandle,
    base_url: &str,
    body: &Value,
) -> Result<StreamResponse, ClientError> {
    let vendor = handle.get()?;
    let url = format!("{base_url}/chat/completions");
    let request = vendor.post(&url).bearer_auth(handle.api_key());

    let provider = handle.provider().to_string();
    vendor.stream(request, &url, body, move |_, data| parse_stream_event(&provider, data))
}

pub struct OpenAiClient {
    handle: LazyHandle,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, OPENAI_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            handle: LazyHandle::new("openai", api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn complete(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<Completion, ClientError> {
        let body = chat_body(session, config, false);
        complete(&self.handle, &self.base_url, &body)
            .instrument(info_span!("openai_chat", model = %config.base_model))
            .await
    }
}

#[async_trait]
impl Client for OpenAiClient {
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
        stream(&self.handle, &self.base_url, &chat_body(session, config, true))
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
