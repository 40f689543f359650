use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::credentials;
use crate::error::ClientError;
use crate::factory::ClientFactory;
use crate::provider::{Client, ModelConfig, StreamResponse, StructuredResponse};
use crate::session::ChatSession;

/// Front door for completion calls. Checks that the service has a factory,
/// that a client was supplied and that it holds a credential, then forwards.
pub struct Dispatcher {
    factory: Option<Arc<ClientFactory>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_factory(Arc::new(ClientFactory::new()))
    }
}

impl Dispatcher {
    /// A dispatcher that refuses every call.
    pub fn empty() -> Self {
        Self { factory: None }
    }

    pub fn with_factory(factory: Arc<ClientFactory>) -> Self {
        Self { factory: Some(factory) }
    }

    pub fn is_initialized(&self) -> bool {
        self.factory.is_some()
    }

    pub fn factory(&self) -> Result<&Arc<ClientFactory>, ClientError> {
        self.factory.as_ref().ok_or(ClientError::NotInitialized)
    }

    /// Client for `provider` using the credential from its environment
    /// variable.
    pub fn client_for(&self, provider: &str) -> Result<Arc<dyn Client>, ClientError> {
        let factory = self.factory()?;
        let credential = credentials::resolve(&provider.trim().to_ascii_lowercase())?;
        factory.get_client(provider, &credential)
    }

    fn check<'a>(&self, client: Option<&'a dyn Client>) -> Result<&'a dyn Client, ClientError> {
        if self.factory.is_none() {
            return Err(ClientError::NotInitialized);
        }
        let client = client.ok_or(ClientError::NoClient)?;
        if !client.is_configured() {
            return Err(ClientError::NotConfigured(client.provider_id().to_string()));
        }
        Ok(client)
    }

    #[instrument(skip_all, fields(session = %session.name, model = %config.base_model))]
    pub async fn send_chat_completion(
        &self,
        client: Option<&dyn Client>,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<String, ClientError> {
        let client = self.check(client).inspect_err(|e| warn!("Rejected chat completion: {e}"))?;
        debug!(provider = client.provider_id(), "Dispatching chat completion");
        client.send_chat_completion(session, config).await
    }

    #[instrument(skip_all, fields(session = %session.name, model = %config.base_model))]
    pub async fn stream_chat_completion(
        &self,
        client: Option<&dyn Client>,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> Result<StreamResponse, ClientError> {
        let client = self.check(client).inspect_err(|e| warn!("Rejected stream: {e}"))?;
        debug!(provider = client.provider_id(), "Dispatching stream");
        client.stream_chat_completion(session, config).await
    }

    /// Validation failures come back inside the response, like every other
    /// structured failure.
    #[instrument(skip_all, fields(session = %session.name, model = %config.base_model))]
    pub async fn send_structured_completion(
        &self,
        client: Option<&dyn Client>,
        session: &ChatSession,
        config: &ModelConfig,
    ) -> StructuredResponse {
        match self.check(client) {
            Ok(client) => {
                debug!(provider = client.provider_id(), "Dispatching structured completion");
                client.send_structured_completion(session, config).await
            }
            Err(e) => {
                warn!("Rejected structured completion: {e}");
                StructuredResponse::failed(e)
            }
        }
    }
}
