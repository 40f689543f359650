use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info_span, Instrument};

use super::handle::{DebugTransport, LazyHandle};
use super::openai;
use super::{structured, Client, Completion, ModelConfig, StreamResponse, StructuredResponse};
use crate::error::ClientError;
use crate::session::ChatSession;

/// Vendors that speak the OpenAI chat-completions protocol, with their
/// default endpoints.
pub const COMPATIBLE_VENDORS: [(&str, &str); 2] = [
    ("openrouter", "https://openrouter.ai/api/v1"),
    ("moonshot", "https://api.moonshot.ai/v1"),
];

pub fn default_base_url(provider: &str) -> Option<&'static str> {
    COMPATIBLE_VENDORS
        .iter()
        .find(|(name, _)| *name == provider)
        .map(|(_, url)| *url)
}

/// Generic OpenAI-compatible endpoint. Any reasoning fields the vendor
/// returns are ignored, so structured replies never carry thinking blocks.
pub struct CompatibleClient {
    handle: LazyHandle,
    base_url: String,
}

impl CompatibleClient {
    pub fn new(provider: &str, api_key: &str, base_url: &str) -> Self {
        Self {
            handle: LazyHandle::new(provider.to_ascii_lowercase(), api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn complete(
        &self,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<Completion, ClientError> {
        let body = openai::chat_body(session, config, false);
        let span = info_span!("compatible_chat", provider = %self.provider_id(), model = %config.base_model);
        openai::complete(&self.handle, &self.base_url, &body).instrument(span).await
    }
}

#[async_trait]
impl Client for CompatibleClient {
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
        openai::stream(&self.handle, &self.base_url, &openai::chat_body(session, config, true))
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
