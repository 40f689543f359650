use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use super::handle::{DebugTransport, LazyHandle};
use super::sse::SseAction;
use super::{param, structured, Client, Completion, ModelConfig, StreamResponse, StructuredResponse, ThinkingBlock, ThinkingType};
use crate::error::ClientError;
use crate::session::{ChatSession, Role};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: i64 = 4096;

pub const REDACTED_PLACEHOLDER: &str = "[redacted thinking: content withheld by the provider]";

pub struct AnthropicClient {
    handle: LazyHandle,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, ANTHROPIC_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            handle: LazyHandle::new("anthropic", api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    fn build_body(&self, session: &ChatSession, config: &ModelConfig, stream: bool) -> Value {
        // Anthropic has no system role inside `messages`; stray system
        // messages join the top-level prompt.
        let mut system = session.system_prompt.clone();
        let mut messages = Vec::with_capacity(session.messages.len());

        for m in session.messages() {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(m.content.trim());
                    continue;
                }
                Role::Unknown => {
                    debug!(message_id = %m.id, "Skipping message with unknown role");
                    continue;
                }
            };
            messages.push(json!({ "role": role, "content": &m.content }));
        }

        if messages.is_empty() {
            messages.push(json!({ "role": "user", "content": "" }));
        }

        let mut max_tokens = config.int(param::MAX_TOKENS).unwrap_or(DEFAULT_MAX_TOKENS);
        let budget = config.int(param::THINKING_BUDGET).filter(|b| *b > 0);

        let mut body = json!({
            "model": &config.base_model,
            "messages": messages,
            "stream": stream,
        });

        if !system.is_empty() {
            body["system"] = json!(system);
        }

        match budget {
            Some(budget) => {
                // Extended thinking needs room beyond the budget and fixed sampling.
                if max_tokens <= budget {
                    max_tokens = budget + DEFAULT_MAX_TOKENS;
                }
                body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
            }
            None => {
                if let Some(t) = config.float(param::TEMPERATURE) {
                    body["temperature"] = json!(t);
                }
                if let Some(p) = config.float(param::TOP_P) {
                    body["top_p"] = json!(p);
                }
                if let Some(k) = config.int(param::TOP_K) {
                    body["top_k"] = json!(k);
                }
            }
        }

        body["max_tokens"] = json!(max_tokens);
        body
    }

    async fn complete(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<Completion, ClientError> {
        let vendor = self.handle.get()?;
        let url = self.url();
        let body = self.build_body(session, config, false);

        info!(model = %config.base_model, messages = session.messages.len(), "Sending message");
        let request = vendor
            .post(&url)
            .header("x-api-key", self.handle.api_key())
            .header("anthropic-version", ANTHROPIC_VERSION);

        let reply = vendor
            .send_json(request, &url, &body)
            .instrument(info_span!("anthropic_messages", model = %config.base_model))
            .await?;

        parse_message(self.provider_id(), &reply)
    }
}

/// Splits a Messages API reply into visible text and thinking blocks.
fn parse_message(provider: &str, body: &Value) -> Result<Completion, ClientError> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| ClientError::response_format(provider, "response content missing"))?;

    let mut completion = Completion::default();
    for block in content {
        match block["type"].as_str() {
            Some("text") => completion.text.push_str(block["text"].as_str().unwrap_or_default()),
            Some("thinking") => completion.thinking.push(ThinkingBlock::new(
                provider,
                ThinkingType::Thinking,
                block["thinking"].as_str().unwrap_or_default(),
            )),
            Some("redacted_thinking") => completion.thinking.push(ThinkingBlock::new(
                provider,
                ThinkingType::RedactedThinking,
                REDACTED_PLACEHOLDER,
            )),
            _ => warn!("Unexpected content block: {:?}", block),
        }
    }

    let mut metadata = Map::new();
    for key in ["id", "model", "stop_reason", "usage"] {
        if !body[key].is_null() {
            metadata.insert(key.to_string(), body[key].clone());
        }
    }
    completion.metadata = metadata;

    Ok(completion)
}

/// Maps one Messages API stream event. Only text deltas reach the consumer.
fn parse_stream_event(provider: &str, event: &str, data: &str) -> SseAction {
    match event {
        "content_block_delta" => {
            let delta = match serde_json::from_str::<Value>(data) {
                Ok(v) => v,
                Err(e) => return SseAction::Fail(ClientError::response_format(provider, format!("stream delta: {e}"))),
            };
            match delta["delta"]["type"].as_str() {
                Some("text_delta") => SseAction::Emit(delta["delta"]["text"].as_str().unwrap_or_default().to_string()),
                _ => SseAction::Skip,
            }
        }
        "message_stop" => SseAction::Done,
        "error" => {
            let err = serde_json::from_str::<Value>(data).unwrap_or_default();
            SseAction::Fail(ClientError::Api {
                provider: provider.to_string(),
                code: err["error"]["type"].as_str().unwrap_or("stream_error").to_string(),
                message: err["error"]["message"].as_str().unwrap_or(data).to_string(),
            })
        }
        "message_start" | "content_block_start" | "content_block_stop" | "message_delta" | "ping" => {
            debug!(event, "Stream event");
            SseAction::Skip
        }
        _ => {
            warn!(event, "Unhandled event type");
            SseAction::Skip
        }
    }
}

#[async_trait]
impl Client for AnthropicClient {
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
        let url = self.url();
        let body = self.build_body(session, config, true);

        info!(model = %config.base_model, "Starting stream");
        let request = vendor
            .post(&url)
            .header("x-api-key", self.handle.api_key())
            .header("anthropic-version", ANTHROPIC_VERSION);

        let provider = self.provider_id().to_string();
        vendor.stream(request, &url, &body, move |event, data| parse_stream_event(&provider, event, data))
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

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::session::Message;

    fn session() -> ChatSession {
        let mut session = ChatSession::new("a", "You are terse.");
        session.append(Message::user("2+2?"));
        session
    }

    #[test]
    fn system_messages_fold_into_prompt() {
        let client = AnthropicClient::new("key");
        let mut session = session();
        session.append(Message::new(Role::System, "Answer in French.", chrono::Utc::now()));

        let body = client.build_body(&session, &ModelConfig::new("anthropic", "claude-sonnet-4"), false);

        assert_eq!(body["system"], "You are terse.\nAnswer in French.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn empty_request_is_well_formed() {
        let client = AnthropicClient::new("key");
        let body = client.build_body(&ChatSession::new("e", ""), &ModelConfig::new("anthropic", "claude"), false);

        assert!(body.get("system").is_none());
        assert_eq!(body["messages"], json!([{"role": "user", "content": ""}]));
    }

    #[test]
    fn thinking_budget_drops_sampling() {
        let client = AnthropicClient::new("key");
        let config = ModelConfig::new("anthropic", "claude-sonnet-4")
            .with_param(param::THINKING_BUDGET, 8000)
            .with_param(param::MAX_TOKENS, 1000)
            .with_param(param::TEMPERATURE, 0.3)
            .with_param(param::TOP_K, 40);

        let body = client.build_body(&session(), &config, false);

        assert_eq!(body["thinking"]["budget_tokens"], 8000);
        assert_eq!(body["max_tokens"], 8000 + DEFAULT_MAX_TOKENS);
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_k").is_none());
    }

    #[test]
    fn sampling_applies_without_budget() {
        let client = AnthropicClient::new("key");
        let config = ModelConfig::new("anthropic", "claude-sonnet-4")
            .with_param(param::TEMPERATURE, 0.3)
            .with_param(param::TOP_K, 40)
            .with_param(param::FREQUENCY_PENALTY, 0.5);

        let body = client.build_body(&session(), &config, false);

        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["top_k"], 40);
        assert!(body.get("frequency_penalty").is_none());
    }

    #[test]
    fn stream_events() {
        let text = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Four"}}"#;
        let thinking = r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#;
        let overloaded = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;

        assert_matches!(parse_stream_event("anthropic", "content_block_delta", text), SseAction::Emit(t) => { assert_eq!(t, "Four") });
        assert_matches!(parse_stream_event("anthropic", "content_block_delta", thinking), SseAction::Skip);
        assert_matches!(parse_stream_event("anthropic", "ping", "{}"), SseAction::Skip);
        assert_matches!(parse_stream_event("anthropic", "message_stop", "{}"), SseAction::Done);
        assert_matches!(
            parse_stream_event("anthropic", "error", overloaded),
            SseAction::Fail(ClientError::Api { code, .. }) => { assert_eq!(code, "overloaded_error") }
        );
    }

    #[tokio::test]
    async fn thinking_blocks_are_separated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({"model": "claude-sonnet-4", "system": "You are terse."})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "model": "claude-sonnet-4",
                "stop_reason": "end_turn",
                "content": [
                    {"type": "thinking", "thinking": "2+2 is basic arithmetic.", "signature": "sig"},
                    {"type": "redacted_thinking", "data": "EncryptedBlob=="},
                    {"type": "text", "text": "4"}
                ]
            })))
            .mount(&server)
            .await;

        let client = AnthropicClient::with_base_url("key", &server.uri());
        let config = ModelConfig::new("anthropic", "claude-sonnet-4");

        let response = client.send_structured_completion(&session(), &config).await;
        assert!(response.is_ok());
        assert_eq!(response.text_content, "4");
        assert_eq!(response.thinking_blocks.len(), 2);
        assert_eq!(response.thinking_blocks[0].kind, ThinkingType::Thinking);
        assert_eq!(response.thinking_blocks[1].kind, ThinkingType::RedactedThinking);
        assert_eq!(response.thinking_blocks[1].content, REDACTED_PLACEHOLDER);
        assert_eq!(response.metadata["stop_reason"], "end_turn");

        let text = client.send_chat_completion(&session(), &config).await.unwrap();
        assert_eq!(text, "4");
    }

    #[tokio::test]
    async fn stream_stops_on_message_stop() {
        let server = MockServer::start().await;
        let sse = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"content\":[]}}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Fo\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"ur\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let client = AnthropicClient::with_base_url("key", &server.uri());
        let stream = client
            .stream_chat_completion(&session(), &ModelConfig::new("anthropic", "claude-sonnet-4"))
            .await
            .unwrap();

        assert_eq!(stream.collect_text().await.unwrap(), "Four");
    }

    #[tokio::test]
    async fn mid_stream_error_is_terminal() {
        let server = MockServer::start().await;
        let sse = concat!(
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Par\"}}\n\n",
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let client = AnthropicClient::with_base_url("key", &server.uri());
        let mut stream = client
            .stream_chat_completion(&session(), &ModelConfig::new("anthropic", "claude-sonnet-4"))
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.content, "Par");
        let last = stream.next().await.unwrap();
        assert!(last.done);
        assert_matches!(last.error, Some(ClientError::Api { .. }));
        assert!(stream.next().await.is_none());
    }
}
