//! Provider settings
//!
//! API keys, local server URLs, the default save location and per-node
//! default models. Stored as the same snake_case JSON document the desktop
//! app writes, then overridden from the environment.

use std::path::{Path, PathBuf};

use noder_engine::DefaultModels;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_LM_STUDIO_BASE_URL: &str = "http://localhost:1234";

/// Environment variable to settings field
const ENV_OVERRIDES: &[(&str, Field)] = &[
    ("REPLICATE_API_TOKEN", Field::Replicate),
    ("OPENAI_API_KEY", Field::OpenAi),
    ("OPENROUTER_API_KEY", Field::OpenRouter),
    ("ANTHROPIC_API_KEY", Field::Anthropic),
    ("OLLAMA_BASE_URL", Field::Ollama),
    ("LM_STUDIO_BASE_URL", Field::LmStudio),
];

#[derive(Debug, Clone, Copy)]
enum Field {
    Replicate,
    OpenAi,
    OpenRouter,
    Anthropic,
    Ollama,
    LmStudio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub replicate_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub ollama_base_url: Option<String>,
    pub lm_studio_base_url: Option<String>,
    pub default_save_location: Option<String>,
    pub default_text_model: Option<String>,
    pub default_image_model: Option<String>,
    pub default_video_model: Option<String>,
    pub default_audio_model: Option<String>,
    pub default_upscaler_model: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            replicate_api_key: None,
            openai_api_key: None,
            openrouter_api_key: None,
            anthropic_api_key: None,
            ollama_base_url: Some(DEFAULT_OLLAMA_BASE_URL.to_string()),
            lm_studio_base_url: Some(DEFAULT_LM_STUDIO_BASE_URL.to_string()),
            default_save_location: None,
            default_text_model: None,
            default_image_model: None,
            default_video_model: None,
            default_audio_model: None,
            default_upscaler_model: None,
        }
    }
}

impl ProviderSettings {
    /// `<config dir>/noder/settings.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("noder").join("settings.json"))
    }

    /// Read settings from `path`; a missing file yields the defaults
    pub async fn load_from(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                log::debug!("Loading settings from {}", path.display());
                Ok(serde_json::from_str(&contents)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No settings at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load from `path` (or the default location) and apply environment overrides
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::load_from(&path).await?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Replace fields with non-blank values returned by `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (key, field) in ENV_OVERRIDES {
            let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) else {
                continue;
            };
            let slot = match field {
                Field::Replicate => &mut self.replicate_api_key,
                Field::OpenAi => &mut self.openai_api_key,
                Field::OpenRouter => &mut self.openrouter_api_key,
                Field::Anthropic => &mut self.anthropic_api_key,
                Field::Ollama => &mut self.ollama_base_url,
                Field::LmStudio => &mut self.lm_studio_base_url,
            };
            *slot = Some(value);
        }
    }

    /// Default models for nodes that carry no model id
    pub fn default_models(&self) -> DefaultModels {
        DefaultModels {
            text: self.default_text_model.clone(),
            image: self.default_image_model.clone(),
            video: self.default_video_model.clone(),
            audio: self.default_audio_model.clone(),
            upscaler: self.default_upscaler_model.clone(),
        }
    }
}

/// A configured key, with blank strings treated as absent
pub(crate) fn configured(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ProviderSettings::load_from(&dir.path().join("settings.json"))
            .await
            .unwrap();
        assert_eq!(settings, ProviderSettings::default());
        assert_eq!(
            settings.ollama_base_url.as_deref(),
            Some(DEFAULT_OLLAMA_BASE_URL)
        );
    }

    #[tokio::test]
    async fn test_load_ignores_unknown_desktop_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(
            &path,
            r#"{
                "replicate_api_key": "r8_abc",
                "default_image_model": "black-forest-labs/flux-schnell",
                "show_templates": true,
                "edge_type": "bezier"
            }"#,
        )
        .await
        .unwrap();

        let settings = ProviderSettings::load_from(&path).await.unwrap();
        assert_eq!(settings.replicate_api_key.as_deref(), Some("r8_abc"));
        assert_eq!(
            settings.default_models().image.as_deref(),
            Some("black-forest-labs/flux-schnell")
        );
        // Fields absent from the file keep their defaults
        assert_eq!(
            settings.lm_studio_base_url.as_deref(),
            Some(DEFAULT_LM_STUDIO_BASE_URL)
        );
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(ProviderSettings::load_from(&path).await.is_err());
    }

    #[test]
    fn test_overrides_skip_blank_values() {
        let mut settings = ProviderSettings {
            openai_api_key: Some("from-file".into()),
            ..Default::default()
        };
        settings.apply_overrides(|key| match key {
            "REPLICATE_API_TOKEN" => Some("r8_env".into()),
            "OPENAI_API_KEY" => Some("  ".into()),
            "OLLAMA_BASE_URL" => Some("http://gpu-box:11434".into()),
            _ => None,
        });

        assert_eq!(settings.replicate_api_key.as_deref(), Some("r8_env"));
        assert_eq!(settings.openai_api_key.as_deref(), Some("from-file"));
        assert_eq!(
            settings.ollama_base_url.as_deref(),
            Some("http://gpu-box:11434")
        );
    }

    #[test]
    fn test_configured_treats_blank_as_missing() {
        assert_eq!(configured(&Some("  ".into())), None);
        assert_eq!(configured(&Some(" k ".into())), Some("k"));
        assert_eq!(configured(&None), None);
    }
}
