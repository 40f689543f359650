use std::env;

use crate::error::ClientError;

/// Environment variable holding the credential for a provider identity.
/// `openai-reasoning` shares the OpenAI key.
pub fn env_var(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" | "openai-reasoning" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "gemini" => Some("GEMINI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "moonshot" => Some("MOONSHOT_API_KEY"),
        "mock" => Some("MOCK_API_KEY"),
        _ => None,
    }
}

/// Reads the provider's credential from the environment. Blank values count
/// as missing.
pub fn resolve(provider: &str) -> Result<String, ClientError> {
    let var = env_var(provider).ok_or_else(|| ClientError::UnsupportedProvider {
        provider: provider.to_string(),
        supported: crate::factory::supported_providers(),
    })?;

    match env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(ClientError::MissingCredential(var.to_string())),
    }
}
