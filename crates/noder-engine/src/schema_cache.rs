//! Memoizing cache of normalized model schemas
//!
//! One instance is built per engine and handed to the executor; nothing here
//! is global, so concurrent runs in tests never share entries.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio_util::sync::CancellationToken;

use crate::config::SchemaCacheConfig;
use crate::error::{NodeEngineError, Result};
use crate::remote::{with_cancel, PredictionClient};
use crate::router::split_model_id;
use crate::schema::{normalize_schema, NormalizedSchema};

/// Bounded, expiring cache from model id (`owner/name`) to schema
#[derive(Clone)]
pub struct SchemaCache {
    cache: Cache<String, Arc<NormalizedSchema>>,
}

impl SchemaCache {
    /// Create a cache with default bounds
    pub fn new() -> Self {
        Self::with_config(&SchemaCacheConfig::default())
    }

    /// Create a cache with custom bounds
    pub fn with_config(config: &SchemaCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();
        Self { cache }
    }

    /// Cached schema for `model`, if present
    pub async fn get(&self, model: &str) -> Option<Arc<NormalizedSchema>> {
        let (owner, name) = split_model_id(model)?;
        self.cache.get(&format!("{}/{}", owner, name)).await
    }

    /// Seed an entry (used to pre-warm or by tests)
    pub async fn insert(&self, schema: NormalizedSchema) {
        self.cache
            .insert(schema.model_id.clone(), Arc::new(schema))
            .await;
    }

    /// Return the schema for `model`, fetching and normalizing it on a miss
    ///
    /// Concurrent misses for the same model share one fetch. A version suffix
    /// (`owner/name:version`) is ignored for lookup; a bare version id has no
    /// owner to query and fails with `NotFound`.
    pub async fn get_or_fetch(
        &self,
        model: &str,
        client: &dyn PredictionClient,
        cancel: &CancellationToken,
    ) -> Result<Arc<NormalizedSchema>> {
        let (owner, name) = split_model_id(model)
            .ok_or_else(|| NodeEngineError::NotFound(format!("owner of model '{}'", model)))?;
        let model_id = format!("{}/{}", owner, name);

        let init = async {
            log::debug!("Fetching schema for {}", model_id);
            let raw = with_cancel(cancel, client.model_schema(owner, name)).await?;
            normalize_schema(&model_id, &raw).map(Arc::new)
        };

        self.cache
            .try_get_with(model_id.clone(), init)
            .await
            .map_err(|err: Arc<NodeEngineError>| (*err).clone())
    }

    /// Drop one model's entry
    pub async fn invalidate(&self, model: &str) {
        if let Some((owner, name)) = split_model_id(model) {
            self.cache.invalidate(&format!("{}/{}", owner, name)).await;
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}
