//! Error types shared by the core engine.

/// A raw request that cannot be turned into a `RequestRecord`.
///
/// The record is dropped; normalization failures are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
}

/// A single provider failed while scoring or parsing a request.
///
/// The engine skips the offending provider for that request only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Provider '{provider}' failed: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Registry misuse. Fatal to the call, not to the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Provider already registered: {0}")]
    DuplicateProvider(String),
    #[error("Provider not found: {0}")]
    NotFound(String),
}
