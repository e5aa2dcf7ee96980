//! Engine configuration
//!
//! Tunables for polling, schema caching, remote link validity and default
//! models. Every field has a default so a partial JSON document (or none at
//! all) yields a working configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NodeType;

/// Default values, kept in one place so docs and `Default` impls agree
pub mod defaults {
    /// Delay between two status fetches of a prediction
    pub const POLL_INTERVAL_MS: u64 = 2000;
    /// Status fetches before a prediction is declared timed out
    pub const POLL_MAX_ATTEMPTS: u32 = 300;
    /// A progress event is emitted every this many attempts
    pub const POLL_PROGRESS_EVERY: u32 = 10;
    /// Distinct model schemas kept in memory
    pub const SCHEMA_CACHE_CAPACITY: u64 = 256;
    /// Lifetime of a cached schema
    pub const SCHEMA_CACHE_TTL_SECS: u64 = 3600;
    /// A remote link expiring within this window is treated as expired
    pub const LINK_EXPIRY_BUFFER_SECS: i64 = 300;
}

/// Prediction polling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
    pub progress_every: u32,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: defaults::POLL_INTERVAL_MS,
            max_attempts: defaults::POLL_MAX_ATTEMPTS,
            progress_every: defaults::POLL_PROGRESS_EVERY,
        }
    }
}

/// Schema cache bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchemaCacheConfig {
    pub max_capacity: u64,
    pub ttl_secs: u64,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: defaults::SCHEMA_CACHE_CAPACITY,
            ttl_secs: defaults::SCHEMA_CACHE_TTL_SECS,
        }
    }
}

/// Model used when a generation node carries none
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultModels {
    pub text: Option<String>,
    pub image: Option<String>,
    pub video: Option<String>,
    pub audio: Option<String>,
    pub upscaler: Option<String>,
}

impl DefaultModels {
    /// Default model for a node variant, if one is configured
    pub fn for_node(&self, node_type: &NodeType) -> Option<&str> {
        let model = match node_type {
            NodeType::Text => &self.text,
            NodeType::Image => &self.image,
            NodeType::Video => &self.video,
            NodeType::Audio => &self.audio,
            NodeType::Upscaler => &self.upscaler,
            _ => return None,
        };
        model.as_deref().filter(|m| !m.trim().is_empty())
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub poll: PollConfig,
    pub schema_cache: SchemaCacheConfig,
    pub link_expiry_buffer_secs: i64,
    pub default_models: DefaultModels,
    /// Upper bound on nodes running at once within a layer (unbounded if unset)
    pub max_concurrency: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            schema_cache: SchemaCacheConfig::default(),
            link_expiry_buffer_secs: defaults::LINK_EXPIRY_BUFFER_SECS,
            default_models: DefaultModels::default(),
            max_concurrency: None,
        }
    }
}
