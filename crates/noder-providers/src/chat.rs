//! Chat completion providers
//!
//! OpenAI, OpenRouter, Ollama and LM Studio all speak the OpenAI chat
//! completions protocol and differ only in base URL and key. Anthropic uses
//! its own messages API.

use std::collections::HashMap;

use async_trait::async_trait;
use noder_engine::{ChatClient, ChatMessage, ChatRequest};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::error::{parse_body, read_body, ProviderError, Result};
use crate::replicate::bearer_headers;
use crate::settings::{
    configured, ProviderSettings, DEFAULT_LM_STUDIO_BASE_URL, DEFAULT_OLLAMA_BASE_URL,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_MAX_TOKENS: u32 = 1024;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

/// One OpenAI-compatible endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiCompatible {
    pub base_url: String,
    /// Local servers accept unauthenticated requests
    pub api_key: Option<String>,
}

impl OpenAiCompatible {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Base URL of a local server's OpenAI-compatible API
fn local_v1(base: Option<&str>, fallback: &str) -> String {
    let base = base.unwrap_or(fallback).trim_end_matches('/');
    if base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{}/v1", base)
    }
}

/// Split the system prompt out of a message list
///
/// Non-blank system messages are joined; the rest keep their order.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect();
    let rest = messages.iter().filter(|m| m.role != "system").collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, rest)
}

/// Request body for the chat completions protocol
pub fn openai_payload(request: &ChatRequest) -> Value {
    let (system, rest) = split_system(&request.messages);
    let mut messages = vec![json!({
        "role": "system",
        "content": system.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
    })];
    messages.extend(
        rest.into_iter()
            .map(|m| json!({"role": m.role, "content": m.content})),
    );
    json!({
        "model": request.model,
        "messages": messages,
        "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
    })
}

/// Request body for the Anthropic messages API
pub fn anthropic_payload(request: &ChatRequest) -> Value {
    let (system, rest) = split_system(&request.messages);
    let mut payload = json!({
        "model": request.model,
        "messages": rest
            .into_iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>(),
        "max_tokens": ANTHROPIC_MAX_TOKENS,
        "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
    });
    if let Some(system) = system {
        payload["system"] = Value::String(system);
    }
    payload
}

/// `choices[0].message.content`
pub fn parse_openai_reply(response: &Value) -> Result<String> {
    response
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::invalid("No content in chat completion response"))
}

/// First text block of `content`
pub fn parse_anthropic_reply(response: &Value) -> Result<String> {
    response
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
        })
        .and_then(|b| b.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::invalid("No content in response"))
}

/// Chat client covering every chat-style provider
pub struct ProviderChatClient {
    http: reqwest::Client,
    compatible: HashMap<String, OpenAiCompatible>,
    anthropic_key: Option<String>,
    anthropic_base: String,
}

impl ProviderChatClient {
    /// A client with no providers configured
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            compatible: HashMap::new(),
            anthropic_key: None,
            anthropic_base: ANTHROPIC_API_BASE.to_string(),
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let key = |value: &Option<String>| configured(value).map(str::to_string);
        let mut client = Self::new()
            .with_provider(
                "openai",
                OpenAiCompatible::new(OPENAI_API_BASE, key(&settings.openai_api_key)),
            )
            .with_provider(
                "openrouter",
                OpenAiCompatible::new(OPENROUTER_API_BASE, key(&settings.openrouter_api_key)),
            )
            .with_provider(
                "ollama",
                OpenAiCompatible::new(
                    local_v1(configured(&settings.ollama_base_url), DEFAULT_OLLAMA_BASE_URL),
                    None,
                ),
            )
            .with_provider(
                "lmstudio",
                OpenAiCompatible::new(
                    local_v1(
                        configured(&settings.lm_studio_base_url),
                        DEFAULT_LM_STUDIO_BASE_URL,
                    ),
                    None,
                ),
            );
        client.anthropic_key = key(&settings.anthropic_api_key);
        client
    }

    /// Register or replace an OpenAI-compatible provider
    pub fn with_provider(mut self, name: impl Into<String>, endpoint: OpenAiCompatible) -> Self {
        self.compatible.insert(name.into(), endpoint);
        self
    }

    pub fn provider(&self, name: &str) -> Option<&OpenAiCompatible> {
        self.compatible.get(name)
    }

    async fn complete_compatible(
        &self,
        name: &str,
        endpoint: &OpenAiCompatible,
        request: &ChatRequest,
    ) -> Result<String> {
        let mut headers = match &endpoint.api_key {
            Some(key) => bearer_headers(key)?,
            None if is_local(name) => HeaderMap::new(),
            None => return Err(ProviderError::MissingApiKey(display_name(name))),
        };
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self
            .http
            .post(endpoint.completions_url())
            .headers(headers)
            .json(&openai_payload(request))
            .send()
            .await?;
        let body: Value = parse_body(&read_body(response).await?)?;
        parse_openai_reply(&body)
    }

    async fn complete_anthropic(&self, request: &ChatRequest) -> Result<String> {
        let key = self
            .anthropic_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingApiKey("Anthropic".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(key)?);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self
            .http
            .post(format!("{}/messages", self.anthropic_base))
            .headers(headers)
            .json(&anthropic_payload(request))
            .send()
            .await?;
        let body: Value = parse_body(&read_body(response).await?)?;
        parse_anthropic_reply(&body)
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        log::debug!("Chat completion via {} ({})", request.provider, request.model);
        if request.provider == "anthropic" {
            return self.complete_anthropic(request).await;
        }
        let endpoint = self
            .compatible
            .get(&request.provider)
            .ok_or_else(|| ProviderError::UnknownProvider(request.provider.clone()))?;
        self.complete_compatible(&request.provider, endpoint, request).await
    }
}

impl Default for ProviderChatClient {
    fn default() -> Self {
        Self::new()
    }
}

fn is_local(name: &str) -> bool {
    matches!(name, "ollama" | "lmstudio")
}

fn display_name(name: &str) -> String {
    match name {
        "openai" => "OpenAI".to_string(),
        "openrouter" => "OpenRouter".to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ChatClient for ProviderChatClient {
    async fn chat_completion(&self, request: ChatRequest) -> noder_engine::Result<String> {
        Ok(self.complete(&request).await?)
    }
}
