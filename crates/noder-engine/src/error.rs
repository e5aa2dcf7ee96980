//! Error types for the node engine

use thiserror::Error;

/// Result type alias using NodeEngineError
pub type Result<T> = std::result::Result<T, NodeEngineError>;

/// Errors that can occur in the node engine
#[derive(Debug, Clone, Error)]
pub enum NodeEngineError {
    /// The graph cannot be ordered; carries every node left without a layer
    #[error("Workflow contains a cycle involving nodes: {}", node_ids.join(", "))]
    Cycle { node_ids: Vec<String> },

    /// Connected inputs are not acceptable for the model's schema
    #[error("{0}")]
    Validation(String),

    /// Remote job failed or was rejected by the provider
    #[error("{0}")]
    Provider(String),

    /// Prediction never reached a terminal status within the attempt budget
    #[error("Prediction {prediction_id} timed out after {attempts} attempts")]
    Timeout { prediction_id: String, attempts: u32 },

    /// Reference to a missing node or model
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing required input
    #[error("{0}")]
    MissingInput(String),

    /// Task execution failed
    #[error("{0}")]
    ExecutionFailed(String),

    /// Uploading a local file to the remote store failed
    #[error("Upload failed: {0}")]
    Upload(String),

    /// Removing a remote file failed
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// Workflow was cancelled
    #[error("Workflow cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl NodeEngineError {
    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Create a provider error with a message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a validation error with a message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Upload and cleanup failures are logged, never escalated to run failure
    pub fn is_best_effort(&self) -> bool {
        matches!(self, Self::Upload(_) | Self::Cleanup(_))
    }
}

impl From<serde_json::Error> for NodeEngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for NodeEngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
