//! HTTP transport for the Noder engine
//!
//! Concrete implementations of the engine's remote contracts:
//! - **Predictions and files**: a Replicate-style REST API ([`ReplicateClient`])
//! - **Chat**: OpenAI-compatible servers (OpenAI, OpenRouter, Ollama, LM Studio)
//!   and Anthropic ([`ProviderChatClient`])
//! - **Downloads**: saving outputs to a local folder ([`LocalMediaSaver`])
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use noder_providers::{ProviderChatClient, ProviderSettings, ReplicateClient};
//!
//! let settings = ProviderSettings::load(None).await?;
//! let replicate = Arc::new(ReplicateClient::from_settings(&settings)?);
//! let context = ExecutionContext::new(replicate.clone(), EngineConfig::default())
//!     .with_chat(Arc::new(ProviderChatClient::from_settings(&settings)));
//! ```

pub mod chat;
pub mod download;
pub mod error;
pub mod replicate;
pub mod settings;

pub use chat::{OpenAiCompatible, ProviderChatClient};
pub use download::{sanitize_filename, LocalMediaSaver};
pub use error::{ProviderError, Result};
pub use replicate::ReplicateClient;
pub use settings::ProviderSettings;
