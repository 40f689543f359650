use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Map};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, info_span, Instrument};

use super::handle::DebugTransport;
use super::sse::STREAM_BUFFER;
use super::{Client, ModelConfig, StreamChunk, StreamResponse, StructuredResponse, ThinkingBlock, ThinkingType};
use crate::error::{ClientError, ErrorType, LlmError};
use crate::session::ChatSession;

pub const RATE_LIMIT_TRIGGER: &str = "trigger rate limit";
pub const EMPTY_RESPONSE_TRIGGER: &str = "trigger empty response";

/// Offline adapter. Replies by echoing the last user message and fails on
/// request when that message contains a trigger phrase.
pub struct MockClient {
    api_key: String,
    calls: AtomicUsize,
    debug: Mutex<Option<Arc<dyn DebugTransport>>>,
}

enum Reply {
    Text(String),
    RateLimited(String),
    Empty,
}

impl MockClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            calls: AtomicUsize::new(0),
            debug: Mutex::new(None),
        }
    }

    /// Number of completion calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn reply(&self, session: &ChatSession) -> Result<Reply, ClientError> {
        if !self.is_configured() {
            return Err(ClientError::Initialization {
                provider: "mock".to_string(),
                reason: "api key is empty".to_string(),
            });
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let last = session.last_user_message().unwrap_or_default();
        let lowered = last.to_lowercase();

        let echo = format!("You said: {last}");
        let reply = if lowered.contains(RATE_LIMIT_TRIGGER) {
            Reply::RateLimited(echo)
        } else if lowered.contains(EMPTY_RESPONSE_TRIGGER) {
            Reply::Empty
        } else {
            Reply::Text(echo)
        };

        let transport = self.debug.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(transport) = transport {
            transport.request("mock", "mock://chat", &json!({ "messages": session.messages.len() }));
            transport.response("mock", 200, last);
        }
        Ok(reply)
    }
}

fn thinking(last: &str) -> ThinkingBlock {
    let words = last.split_whitespace().count();
    ThinkingBlock::new(
        "mock",
        ThinkingType::Thinking,
        format!("The user sent {words} words; echoing them back."),
    )
}

#[async_trait]
impl Client for MockClient {
    fn provider_id(&self) -> &str {
        "mock"
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn send_chat_completion(
        &self,
        session: &ChatSession,
        _config: &ModelConfig,
    ) -> Result<String, ClientError> {
        match self.reply(session)? {
            Reply::Text(text) => Ok(text),
            Reply::RateLimited(_) => Err(ClientError::from_status(
                "mock",
                429,
                r#"{"error":{"type":"rate_limit_exceeded","message":"Rate limit exceeded"}}"#,
            )),
            Reply::Empty => Err(ClientError::EmptyResponse("mock".to_string())),
        }
    }

    async fn stream_chat_completion(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<StreamResponse, ClientError> {
        let reply = self.reply(session)?;
        let (tx, rx) = mpsc::channel::<StreamChunk>(STREAM_BUFFER);
        let span = info_span!("mock_stream", model = %config.base_model);

        task::spawn(
            async move {
                let (text, terminal) = match reply {
                    Reply::Text(text) => (text, StreamChunk::done()),
                    Reply::RateLimited(text) => (
                        text,
                        StreamChunk::failed(ClientError::from_status("mock", 429, "Rate limit exceeded")),
                    ),
                    Reply::Empty => (String::new(), StreamChunk::failed(ClientError::EmptyResponse("mock".to_string()))),
                };

                for (i, word) in text.split(' ').enumerate() {
                    let piece = if i == 0 { word.to_string() } else { format!(" {word}") };
                    if piece.is_empty() {
                        continue;
                    }
                    if tx.send(StreamChunk::content(piece)).await.is_err() {
                        info!("Consumer dropped stream");
                        return;
                    }
                }

                let _ = tx.send(terminal).await;
                debug!("Finished streaming")
            }
            .instrument(span),
        );

        Ok(StreamResponse::new(json!({ "provider": "mock" }), rx))
    }

    async fn send_structured_completion(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> StructuredResponse {
        let reply = match self.reply(session) {
            Ok(reply) => reply,
            Err(e) => return StructuredResponse::failed(e),
        };

        let last = session.last_user_message().unwrap_or_default();
        let mut metadata = Map::new();
        metadata.insert("provider".to_string(), json!("mock"));
        metadata.insert("model".to_string(), json!(config.base_model));

        match reply {
            Reply::Text(text) => StructuredResponse {
                text_content: text,
                thinking_blocks: vec![thinking(last)],
                error: None,
                metadata,
            },
            Reply::RateLimited(text) => {
                let cut = text.len() / 2;
                let partial = text
                    .char_indices()
                    .take_while(|(i, _)| *i < cut)
                    .map(|(_, c)| c)
                    .collect();

                StructuredResponse {
                    text_content: partial,
                    thinking_blocks: vec![
                        thinking(last),
                        ThinkingBlock::new("mock", ThinkingType::Thinking, "Quota ran out mid-reply."),
                    ],
                    error: Some(LlmError::new(
                        "rate_limit_exceeded",
                        "Rate limit exceeded, retry later",
                        ErrorType::ApiError,
                    )),
                    metadata,
                }
            }
            Reply::Empty => StructuredResponse {
                error: Some(ClientError::EmptyResponse("mock".to_string()).into()),
                metadata,
                ..StructuredResponse::default()
            },
        }
    }

    fn set_debug_transport(&self, transport: Option<Arc<dyn DebugTransport>>) {
        *self.debug.lock().unwrap_or_else(PoisonError::into_inner) = transport;
    }
}
