use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::RequestBuilder;
use serde_json::Value;
use tracing::{debug, info};

use super::sse::{self, SseAction};
use super::StreamResponse;
use crate::error::ClientError;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Longest silence tolerated between reads. Streams have no overall
/// deadline, so this is what ends a stalled one.
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Observer for the raw traffic of an adapter. Credentials travel in headers
/// and are never passed here.
pub trait DebugTransport: Send + Sync {
    fn request(&self, provider: &str, url: &str, body: &Value);
    fn response(&self, provider: &str, status: u16, body: &str);
}

/// Logs bodies at debug level.
pub struct TracingTransport;

impl DebugTransport for TracingTransport {
    fn request(&self, provider: &str, url: &str, body: &Value) {
        debug!(provider, url, body = %body, "LLM request");
    }

    fn response(&self, provider: &str, status: u16, body: &str) {
        debug!(provider, status, body, "LLM response");
    }
}

/// A ready vendor connection: a pooled HTTP client plus the observer it was
/// built with.
pub struct VendorHandle {
    provider: String,
    http: reqwest::Client,
    debug: Option<Arc<dyn DebugTransport>>,
}

impl VendorHandle {
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.http.post(url)
    }

    /// Sends `body` and parses a successful reply as JSON. Non-2xx replies
    /// become [`ClientError::Http`] with the vendor's message.
    pub async fn send_json(
        &self,
        request: RequestBuilder,
        url: &str,
        body: &Value,
    ) -> Result<Value, ClientError> {
        if let Some(debug) = &self.debug {
            debug.request(&self.provider, url, body);
        }

        let resp = request.timeout(REQUEST_TIMEOUT).json(body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        info!(provider = %self.provider, status = status.as_u16(), "Response received");

        if let Some(debug) = &self.debug {
            debug.response(&self.provider, status.as_u16(), &text);
        }

        if !status.is_success() {
            return Err(ClientError::from_status(&self.provider, status.as_u16(), &text));
        }

        serde_json::from_str(&text).map_err(|e| ClientError::response_format(&self.provider, e.to_string()))
    }

    /// Opens a server-sent-event stream and hands each event to `parse` on a
    /// worker task.
    pub(crate) fn stream<P>(
        &self,
        request: RequestBuilder,
        url: &str,
        body: &Value,
        parse: P,
    ) -> Result<StreamResponse, ClientError>
    where
        P: FnMut(&str, &str) -> SseAction + Send + 'static,
    {
        if let Some(debug) = &self.debug {
            debug.request(&self.provider, url, body);
        }

        sse::spawn(self.provider.clone(), request.json(body), self.debug.clone(), parse)
    }
}

enum HandleState {
    Uninitialized,
    Ready(Arc<VendorHandle>),
}

struct Inner {
    state: HandleState,
    transport: Option<Arc<dyn DebugTransport>>,
}

/// Vendor handle built on first use and kept until the debug transport
/// changes.
pub struct LazyHandle {
    provider: String,
    api_key: String,
    read_timeout: Duration,
    inner: Mutex<Inner>,
}

impl LazyHandle {
    pub fn new<P: Into<String>, K: Into<String>>(provider: P, api_key: K) -> Self {
        Self {
            provider: provider.into(),
            api_key: api_key.into(),
            read_timeout: READ_TIMEOUT,
            inner: Mutex::new(Inner {
                state: HandleState::Uninitialized,
                transport: None,
            }),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(inner.state, HandleState::Ready(_))
    }

    pub fn get(&self) -> Result<Arc<VendorHandle>, ClientError> {
        if !self.is_configured() {
            return Err(ClientError::Initialization {
                provider: self.provider.clone(),
                reason: "api key is empty".to_string(),
            });
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let HandleState::Ready(handle) = &inner.state {
            return Ok(handle.clone());
        }

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(self.read_timeout)
            .build()
            .map_err(|e| ClientError::Initialization {
                provider: self.provider.clone(),
                reason: e.to_string(),
            })?;

        let handle = Arc::new(VendorHandle {
            provider: self.provider.clone(),
            http,
            debug: inner.transport.clone(),
        });
        inner.state = HandleState::Ready(handle.clone());

        debug!(provider = %self.provider, "Initialized vendor handle");
        Ok(handle)
    }

    pub fn set_debug_transport(&self, transport: Option<Arc<dyn DebugTransport>>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.transport = transport;
        inner.state = HandleState::Uninitialized;
    }
}
