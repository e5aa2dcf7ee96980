//! Contracts of the remote-execution collaborator
//!
//! The engine never speaks HTTP itself. Predictions, model schemas, file
//! storage, chat completion and downloads sit behind these traits so a
//! concrete transport (or an in-memory fake) can be plugged in.

use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeEngineError, Result};

/// Lifecycle status of a prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    /// Any status string this engine does not know; treated as in flight
    #[serde(other)]
    Unknown,
}

impl PredictionStatus {
    /// Whether polling can stop
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }
}

/// One asynchronous generation job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub logs: Option<String>,
}

impl Prediction {
    /// A freshly submitted prediction
    pub fn starting(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: PredictionStatus::Starting,
            output: None,
            error: None,
            logs: None,
        }
    }
}

/// A file stored by the remote provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub id: String,
    /// URL the provider serves the file from
    pub url: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One turn of a chat conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion request addressed to one chat-style provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Provider key (`openai`, `anthropic`, ...)
    pub provider: String,
    /// Model name as the provider knows it (owner prefix stripped)
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
}

/// Asynchronous job submission and model metadata
#[async_trait]
pub trait PredictionClient: Send + Sync {
    /// Submit a job for `model` (`owner/name`, `owner/name:version` or a bare version id)
    async fn create_prediction(&self, model: &str, input: Value) -> Result<Prediction>;

    /// Fetch the current state of a job
    async fn get_prediction(&self, id: &str) -> Result<Prediction>;

    /// Ask the provider to stop a job
    async fn cancel_prediction(&self, id: &str) -> Result<()>;

    /// Raw OpenAPI-like schema document of a model
    async fn model_schema(&self, owner: &str, name: &str) -> Result<Value>;
}

/// Chat-style completion
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Returns the assistant message content of the first choice
    async fn chat_completion(&self, request: ChatRequest) -> Result<String>;
}

/// Remote file storage
#[async_trait]
pub trait FileClient: Send + Sync {
    async fn upload_file(&self, path: &Path, filename: &str, content_type: &str)
        -> Result<UploadedFile>;

    async fn delete_file(&self, file_id: &str) -> Result<()>;

    /// Whether a remote URL still resolves
    async fn url_exists(&self, url: &str) -> Result<bool>;
}

/// Persists a produced asset locally
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Download `url` into `folder` (or the default location) and return the saved path
    async fn download_and_save(
        &self,
        url: &str,
        filename: Option<&str>,
        folder: Option<&Path>,
    ) -> Result<PathBuf>;
}

/// Race `future` against `cancel`, returning [`NodeEngineError::Cancelled`]
/// if the token fires first
pub async fn with_cancel<T, F>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NodeEngineError::Cancelled),
        result = future => result,
    }
}
