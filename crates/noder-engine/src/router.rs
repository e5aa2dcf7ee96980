//! Provider routing for text models
//!
//! Decides whether a text node's `owner/name` model is answered by a chat
//! completion API or submitted as an asynchronous prediction. The decision is
//! a lookup in an owner table; nothing is inferred from model schemas.

use std::collections::{HashMap, HashSet};

/// Where a text model is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Chat completion on `provider` with the owner prefix stripped from `model`
    Chat { provider: String, model: String },
    /// Asynchronous prediction with the full model id
    Prediction,
}

/// Strategy deciding the route of a model id
pub trait ProviderRouter: Send + Sync {
    fn route(&self, model: &str) -> Route;
}

/// Split `owner/name[:version]` into owner and name
///
/// Returns `None` for ids without an owner (bare version hashes).
pub fn split_model_id(model: &str) -> Option<(&str, &str)> {
    let without_version = model.split(':').next().unwrap_or(model).trim();
    let (owner, name) = without_version.split_once('/')?;
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner, name))
}

/// Owner-table routing policy
///
/// Owners listed as chat-style map to a provider key understood by the chat
/// client. Owners in neither table fall back to prediction.
#[derive(Debug, Clone)]
pub struct OwnerTableRouter {
    chat_owners: HashMap<String, String>,
    job_owners: HashSet<String>,
}

impl OwnerTableRouter {
    /// Empty tables; every model routes to prediction
    pub fn empty() -> Self {
        Self {
            chat_owners: HashMap::new(),
            job_owners: HashSet::new(),
        }
    }

    /// Route `owner` to chat `provider`
    pub fn with_chat_owner(mut self, owner: &str, provider: &str) -> Self {
        self.chat_owners
            .insert(owner.to_ascii_lowercase(), provider.to_string());
        self
    }

    /// Mark `owner` as prediction-style
    pub fn with_job_owner(mut self, owner: &str) -> Self {
        self.job_owners.insert(owner.to_ascii_lowercase());
        self
    }

    pub fn is_known_owner(&self, owner: &str) -> bool {
        let owner = owner.to_ascii_lowercase();
        self.chat_owners.contains_key(&owner) || self.job_owners.contains(&owner)
    }
}

impl Default for OwnerTableRouter {
    fn default() -> Self {
        let router = Self::empty()
            .with_chat_owner("openai", "openai")
            .with_chat_owner("anthropic", "anthropic")
            .with_chat_owner("openrouter", "openrouter")
            .with_chat_owner("ollama", "ollama")
            .with_chat_owner("lmstudio", "lmstudio")
            .with_chat_owner("lm-studio", "lmstudio");
        ["meta", "mistralai", "deepseek-ai", "ibm-granite", "replicate", "google"]
            .into_iter()
            .fold(router, |r, owner| r.with_job_owner(owner))
    }
}

impl ProviderRouter for OwnerTableRouter {
    fn route(&self, model: &str) -> Route {
        let Some((owner, name)) = split_model_id(model) else {
            return Route::Prediction;
        };
        let owner = owner.to_ascii_lowercase();

        if let Some(provider) = self.chat_owners.get(&owner) {
            return Route::Chat {
                provider: provider.clone(),
                model: name.to_string(),
            };
        }
        if !self.job_owners.contains(&owner) {
            log::debug!("Owner '{}' not in routing table, using prediction", owner);
        }
        Route::Prediction
    }
}
