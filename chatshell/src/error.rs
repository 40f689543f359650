use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failures of session registry operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session name: {0}")]
    InvalidName(String),

    #[error("session {identifier:?} not found (tried {})", .attempted.join(", "))]
    NotFound {
        identifier: String,
        attempted: Vec<String>,
    },

    #[error("session identifier {identifier:?} is ambiguous, matches: {}", .matches.join(", "))]
    Ambiguous {
        identifier: String,
        matches: Vec<String>,
    },

    #[error("session file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session store error: {0}")]
    Yaml(#[from] serde_yml::Error),
}

/// Failures of client lookup and provider calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("llm service not initialized")]
    NotInitialized,

    #[error("no llm client provided")]
    NoClient,

    #[error("llm client for {0} is not configured")]
    NotConfigured(String),

    #[error("unsupported provider {provider:?}, supported providers: {}", .supported.join(", "))]
    UnsupportedProvider {
        provider: String,
        supported: Vec<String>,
    },

    #[error("provider identity is empty")]
    EmptyProvider,

    #[error("credential is empty")]
    EmptyCredential,

    #[error("no cached client with id {0:?}")]
    UnknownClientId(String),

    #[error("missing credential, set the {0} environment variable")]
    MissingCredential(String),

    #[error("failed to initialize {provider} client: {reason}")]
    Initialization { provider: String, reason: String },

    #[error("{provider} request failed with status {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("{provider} api error ({code}): {message}")]
    Api {
        provider: String,
        code: String,
        message: String,
    },

    #[error("{0} returned empty response content")]
    EmptyResponse(String),

    #[error("unexpected {provider} response format: {reason}")]
    ResponseFormat { provider: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("stream error: {0}")]
    Stream(String),
}

impl ClientError {
    /// Builds an `Http` error from a failed vendor response, pulling the
    /// vendor's own code and message out of `{"error": {...}}` bodies.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let (code, message) = match vendor_error(body) {
            Some((code, message)) => (code, message),
            None => (None, body.trim().to_string()),
        };

        ClientError::Http {
            provider: provider.to_string(),
            status,
            code,
            message,
        }
    }

    pub fn response_format(provider: &str, reason: impl Into<String>) -> Self {
        ClientError::ResponseFormat {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    /// Machine-stable description of this failure for structured responses.
    pub fn to_llm_error(&self) -> LlmError {
        let (code, kind) = match self {
            ClientError::NotInitialized => ("service_not_initialized".to_string(), ErrorType::ServiceError),
            ClientError::NoClient => ("client_missing".to_string(), ErrorType::ClientError),
            ClientError::NotConfigured(_) => ("client_not_configured".to_string(), ErrorType::ClientError),
            ClientError::UnsupportedProvider { .. } => ("unsupported_provider".to_string(), ErrorType::ClientError),
            ClientError::EmptyProvider => ("empty_provider".to_string(), ErrorType::ClientError),
            ClientError::EmptyCredential | ClientError::MissingCredential(_) => {
                ("missing_credential".to_string(), ErrorType::ClientError)
            }
            ClientError::UnknownClientId(_) => ("unknown_client_id".to_string(), ErrorType::ClientError),
            ClientError::Initialization { .. } => {
                ("initialization_failed".to_string(), ErrorType::InitializationError)
            }
            ClientError::Http { status: 429, .. } => ("rate_limit_exceeded".to_string(), ErrorType::ApiError),
            ClientError::Http { status, code, .. } => {
                let code = code.clone().unwrap_or_else(|| format!("http_{status}"));
                (code, ErrorType::ApiError)
            }
            ClientError::Api { code, .. } => (code.clone(), ErrorType::ApiError),
            ClientError::EmptyResponse(_) => ("empty_response".to_string(), ErrorType::ResponseError),
            ClientError::ResponseFormat { .. } => ("invalid_response".to_string(), ErrorType::ResponseError),
            ClientError::Transport(_) => ("request_failed".to_string(), ErrorType::ApiError),
            ClientError::Stream(_) => ("stream_failed".to_string(), ErrorType::ApiError),
        };

        LlmError {
            code,
            message: self.to_string(),
            kind,
        }
    }
}

/// Category of a failure carried inside a structured response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ApiError,
    ClientError,
    ServiceError,
    ResponseError,
    InitializationError,
}

/// Error value embedded in a structured response rather than returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmError {
    pub code: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorType,
}

impl LlmError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, kind: ErrorType) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind,
        }
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl From<ClientError> for LlmError {
    fn from(e: ClientError) -> Self {
        e.to_llm_error()
    }
}

/// Extracts `(code, message)` from the `{"error": {...}}` envelope that
/// OpenAI, Anthropic and Gemini all use in some form.
fn vendor_error(body: &str) -> Option<(Option<String>, String)> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;

    let message = error["message"].as_str()?.to_string();
    let code = ["code", "type", "status"]
        .iter()
        .find_map(|k| match &error[*k] {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        });

    Some((code, message))
}
