//! Error types for the provider transports

use noder_engine::NodeEngineError;
use thiserror::Error;

/// Result type alias using ProviderError
pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status returned by a provider API
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("{0} API key not configured. Please add it in Settings.")]
    MissingApiKey(String),

    #[error("Unknown chat provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }
}

impl From<ProviderError> for NodeEngineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Api { status: 404, body } => NodeEngineError::NotFound(body),
            ProviderError::Io(e) => NodeEngineError::Io(e.to_string()),
            other => NodeEngineError::Provider(other.to_string()),
        }
    }
}

/// Turn a response into its body, or an `Api` error for non-success statuses
pub(crate) async fn read_body(response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

/// Parse a successful JSON body, keeping the raw text in the error
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| ProviderError::invalid(format!("{} - Response: {}", e, body)))
}
