use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::ClientError;
use crate::provider::anthropic::AnthropicClient;
use crate::provider::compatible::{self, CompatibleClient};
use crate::provider::gemini::GeminiClient;
use crate::provider::mock::MockClient;
use crate::provider::openai::OpenAiClient;
use crate::provider::reasoning::OpenAiReasoningClient;
use crate::provider::Client;

pub const SUPPORTED_PROVIDERS: [&str; 7] = [
    "openai",
    "openai-reasoning",
    "anthropic",
    "gemini",
    "openrouter",
    "moonshot",
    "mock",
];

pub fn supported_providers() -> Vec<String> {
    SUPPORTED_PROVIDERS.iter().map(|p| p.to_string()).collect()
}

pub fn is_supported(provider: &str) -> bool {
    SUPPORTED_PROVIDERS.contains(&provider)
}

// Neither provider names nor credentials contain NUL.
const KEY_SEPARATOR: char = '\0';

#[derive(Default)]
struct Cache {
    clients: HashMap<String, Arc<dyn Client>>,
    ids: HashMap<String, String>,
}

/// Builds provider adapters and keeps one per (provider, credential) pair.
#[derive(Default)]
pub struct ClientFactory {
    base_urls: HashMap<String, String>,
    cache: RwLock<Cache>,
}

impl ClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points every adapter built for `provider` at another endpoint.
    pub fn with_base_url(mut self, provider: &str, base_url: &str) -> Self {
        self.base_urls
            .insert(provider.to_ascii_lowercase(), base_url.to_string());
        self
    }

    pub fn get_client(
        &self,
        provider: &str,
        credential: &str,
    ) -> Result<Arc<dyn Client>, ClientError> {
        self.get_client_with_id(provider, credential).map(|(_, client)| client)
    }

    /// Like [`get_client`](Self::get_client) but also returns the short id
    /// the client can later be fetched by.
    pub fn get_client_with_id(
        &self,
        provider: &str,
        credential: &str,
    ) -> Result<(String, Arc<dyn Client>), ClientError> {
        let provider = provider.trim().to_ascii_lowercase();
        if provider.is_empty() {
            return Err(ClientError::EmptyProvider);
        }
        if credential.is_empty() {
            return Err(ClientError::EmptyCredential);
        }
        if !is_supported(&provider) {
            return Err(ClientError::UnsupportedProvider {
                provider,
                supported: supported_providers(),
            });
        }

        let key = format!("{provider}{KEY_SEPARATOR}{credential}");
        let id = client_id(&provider, credential);

        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(client) = cache.clients.get(&key) {
                return Ok((id, client.clone()));
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = cache.clients.get(&key) {
            return Ok((id, client.clone()));
        }

        let client = self.build(&provider, credential);
        cache.clients.insert(key.clone(), client.clone());
        cache.ids.insert(id.clone(), key);
        info!(provider = %provider, id = %id, "Created client");

        Ok((id, client))
    }

    pub fn get_client_by_id(&self, id: &str) -> Result<Arc<dyn Client>, ClientError> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache
            .ids
            .get(id)
            .and_then(|key| cache.clients.get(key))
            .cloned()
            .ok_or_else(|| ClientError::UnknownClientId(id.to_string()))
    }

    pub fn clear_cache(&self) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        debug!(count = cache.clients.len(), "Clearing client cache");
        cache.clients.clear();
        cache.ids.clear();
    }

    pub fn cached_client_count(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).clients.len()
    }

    fn build(&self, provider: &str, credential: &str) -> Arc<dyn Client> {
        let base_url = self.base_urls.get(provider).map(String::as_str);

        match (provider, base_url) {
            ("openai", Some(url)) => Arc::new(OpenAiClient::with_base_url(credential, url)),
            ("openai", None) => Arc::new(OpenAiClient::new(credential)),
            ("openai-reasoning", Some(url)) => Arc::new(OpenAiReasoningClient::with_base_url(credential, url)),
            ("openai-reasoning", None) => Arc::new(OpenAiReasoningClient::new(credential)),
            ("anthropic", Some(url)) => Arc::new(AnthropicClient::with_base_url(credential, url)),
            ("anthropic", None) => Arc::new(AnthropicClient::new(credential)),
            ("gemini", Some(url)) => Arc::new(GeminiClient::with_base_url(credential, url)),
            ("gemini", None) => Arc::new(GeminiClient::new(credential)),
            ("mock", _) => Arc::new(MockClient::new(credential)),
            (vendor, url) => {
                let url = url.or_else(|| compatible::default_base_url(vendor)).unwrap_or_default();
                Arc::new(CompatibleClient::new(vendor, credential, url))
            }
        }
    }
}

/// `provider:` plus the first four bytes of the credential's SHA-256, in hex.
/// Only meant to tell cached clients apart in listings.
pub fn client_id(provider: &str, credential: &str) -> String {
    let digest = Sha256::digest(credential.as_bytes());
    digest[..4].iter().fold(format!("{provider}:"), |mut id, b| {
        let _ = write!(id, "{b:02x}");
        id
    })
}
