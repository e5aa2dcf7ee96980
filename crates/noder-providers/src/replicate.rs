//! Replicate-style prediction and file API
//!
//! Implements [`PredictionClient`] and [`FileClient`] over the hosted REST
//! API. Every call authenticates with `Authorization: Bearer <token>`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use noder_engine::{FileClient, Prediction, PredictionClient, PredictionStatus, UploadedFile};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{parse_body, read_body, ProviderError, Result};
use crate::settings::{configured, ProviderSettings};

pub const REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";

/// Authorization header for a bearer token
pub(crate) fn bearer_headers(token: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token))?,
    );
    Ok(headers)
}

/// Whether `url` is served by the prediction API itself and needs the token
pub fn is_provider_hosted(url: &str) -> bool {
    url.starts_with("https://api.replicate.com/")
}

/// Endpoint and body for submitting a job for `model`
///
/// `owner/name` goes to the model's own endpoint with just the input.
/// `owner/name:version` and bare version ids go to the generic endpoint
/// with the model reference as `version`.
pub fn prediction_submission(base_url: &str, model: &str, input: Value) -> (String, Value) {
    if model.contains('/') && !model.contains(':') {
        (
            format!("{}/models/{}/predictions", base_url, model),
            json!({ "input": input }),
        )
    } else {
        (
            format!("{}/predictions", base_url),
            json!({ "version": model, "input": input }),
        )
    }
}

/// Prediction as the API reports it; `error` may be a string or an object
#[derive(Debug, Deserialize)]
struct RawPrediction {
    id: String,
    status: PredictionStatus,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    logs: Option<String>,
}

impl From<RawPrediction> for Prediction {
    fn from(raw: RawPrediction) -> Self {
        let error = match raw.error {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        };
        Prediction {
            id: raw.id,
            status: raw.status,
            output: raw.output.filter(|o| !o.is_null()),
            error,
            logs: raw.logs,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFileUrls {
    get: String,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    id: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    urls: RawFileUrls,
    #[serde(default)]
    expires_at: Option<String>,
}

impl From<RawFile> for UploadedFile {
    fn from(raw: RawFile) -> Self {
        let expires_at = raw.expires_at.as_deref().and_then(parse_timestamp);
        UploadedFile {
            id: raw.id,
            url: raw.urls.get,
            content_type: raw.content_type,
            size: raw.size,
            expires_at,
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            log::debug!("Ignoring unparseable expiry '{}': {}", value, e);
            None
        }
    }
}

/// Client for predictions, model metadata and file storage
pub struct ReplicateClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ReplicateClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: REPLICATE_API_BASE.to_string(),
        }
    }

    /// Client using the configured token
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        configured(&settings.replicate_api_key)
            .map(Self::new)
            .ok_or_else(|| ProviderError::MissingApiKey("Replicate".to_string()))
    }

    /// Point the client at another deployment of the same API
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> Result<HeaderMap> {
        bearer_headers(&self.api_key)
    }

    async fn submit(&self, model: &str, input: Value) -> Result<Prediction> {
        let (endpoint, body) = prediction_submission(&self.base_url, model, input);
        log::info!("Creating prediction for {} at {}", model, endpoint);

        let mut headers = self.headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let response = self
            .http
            .post(&endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await?;
        let raw: RawPrediction = parse_body(&read_body(response).await?)?;
        Ok(raw.into())
    }

    async fn fetch(&self, id: &str) -> Result<Prediction> {
        let response = self
            .http
            .get(format!("{}/predictions/{}", self.base_url, id))
            .headers(self.headers()?)
            .send()
            .await?;
        let raw: RawPrediction = parse_body(&read_body(response).await?)?;
        Ok(raw.into())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/predictions/{}/cancel", self.base_url, id))
            .headers(self.headers()?)
            .send()
            .await?;
        read_body(response).await?;
        Ok(())
    }

    async fn model(&self, owner: &str, name: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}/models/{}/{}", self.base_url, owner, name))
            .headers(self.headers()?)
            .send()
            .await?;
        parse_body(&read_body(response).await?)
    }

    async fn upload(&self, path: &Path, filename: &str, content_type: &str) -> Result<UploadedFile> {
        let bytes = tokio::fs::read(path).await?;
        log::info!("Uploading {} ({} bytes)", filename, bytes.len());

        let form = Form::new()
            .part(
                "content",
                Part::bytes(bytes)
                    .file_name(filename.to_string())
                    .mime_str(content_type)?,
            )
            .part("metadata", Part::text("{}").mime_str("application/json")?);

        let response = self
            .http
            .post(format!("{}/files", self.base_url))
            .headers(self.headers()?)
            .multipart(form)
            .send()
            .await?;
        let raw: RawFile = parse_body(&read_body(response).await?)?;
        Ok(raw.into())
    }

    async fn delete(&self, file_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/files/{}", self.base_url, file_id))
            .headers(self.headers()?)
            .send()
            .await?;
        read_body(response).await?;
        Ok(())
    }

    async fn probe(&self, url: &str) -> Result<bool> {
        let mut request = self.http.head(url);
        if is_provider_hosted(url) {
            request = request.headers(self.headers()?);
        }
        let response = request.send().await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl PredictionClient for ReplicateClient {
    async fn create_prediction(&self, model: &str, input: Value) -> noder_engine::Result<Prediction> {
        Ok(self.submit(model, input).await?)
    }

    async fn get_prediction(&self, id: &str) -> noder_engine::Result<Prediction> {
        Ok(self.fetch(id).await?)
    }

    async fn cancel_prediction(&self, id: &str) -> noder_engine::Result<()> {
        Ok(self.cancel(id).await?)
    }

    async fn model_schema(&self, owner: &str, name: &str) -> noder_engine::Result<Value> {
        Ok(self.model(owner, name).await?)
    }
}

#[async_trait]
impl FileClient for ReplicateClient {
    async fn upload_file(
        &self,
        path: &Path,
        filename: &str,
        content_type: &str,
    ) -> noder_engine::Result<UploadedFile> {
        Ok(self.upload(path, filename, content_type).await?)
    }

    async fn delete_file(&self, file_id: &str) -> noder_engine::Result<()> {
        Ok(self.delete(file_id).await?)
    }

    async fn url_exists(&self, url: &str) -> noder_engine::Result<bool> {
        Ok(self.probe(url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_official_model_uses_model_endpoint() {
        let (endpoint, body) = prediction_submission(
            REPLICATE_API_BASE,
            "black-forest-labs/flux-schnell",
            json!({"prompt": "a fox"}),
        );
        assert_eq!(
            endpoint,
            "https://api.replicate.com/v1/models/black-forest-labs/flux-schnell/predictions"
        );
        assert_eq!(body, json!({"input": {"prompt": "a fox"}}));
    }

    #[test]
    fn test_versioned_model_uses_generic_endpoint() {
        let (endpoint, body) =
            prediction_submission(REPLICATE_API_BASE, "owner/model:abc123", json!({}));
        assert_eq!(endpoint, "https://api.replicate.com/v1/predictions");
        assert_eq!(body["version"], "owner/model:abc123");
    }

    #[test]
    fn test_bare_version_uses_generic_endpoint() {
        let (endpoint, body) = prediction_submission(REPLICATE_API_BASE, "5c7d5dc6dd8b", json!({}));
        assert_eq!(endpoint, "https://api.replicate.com/v1/predictions");
        assert_eq!(body["version"], "5c7d5dc6dd8b");
        assert_eq!(body["input"], json!({}));
    }

    #[test]
    fn test_prediction_error_object_is_stringified() {
        let raw: RawPrediction = serde_json::from_value(json!({
            "id": "p1",
            "status": "failed",
            "output": null,
            "error": {"detail": "NSFW content detected"}
        }))
        .unwrap();
        let prediction: Prediction = raw.into();
        assert_eq!(prediction.status, PredictionStatus::Failed);
        assert_eq!(prediction.output, None);
        assert_eq!(
            prediction.error.as_deref(),
            Some(r#"{"detail":"NSFW content detected"}"#)
        );
    }

    #[test]
    fn test_file_response_parses_expiry() {
        let raw: RawFile = serde_json::from_value(json!({
            "id": "file-1",
            "name": "cat.png",
            "content_type": "image/png",
            "size": 2048,
            "urls": {"get": "https://api.replicate.com/v1/files/file-1/download"},
            "created_at": "2026-10-16T10:00:00Z",
            "expires_at": "2026-10-17T10:00:00.000Z"
        }))
        .unwrap();
        let file: UploadedFile = raw.into();
        assert_eq!(file.url, "https://api.replicate.com/v1/files/file-1/download");
        assert_eq!(file.size, Some(2048));
        assert_eq!(
            file.expires_at.map(|t| t.to_rfc3339()),
            Some("2026-10-17T10:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_bad_expiry_is_dropped() {
        let raw: RawFile = serde_json::from_value(json!({
            "id": "file-2",
            "urls": {"get": "https://x.test/f"},
            "expires_at": "tomorrow"
        }))
        .unwrap();
        assert_eq!(UploadedFile::from(raw).expires_at, None);
    }

    #[test]
    fn test_from_settings_requires_token() {
        let settings = ProviderSettings::default();
        assert!(matches!(
            ReplicateClient::from_settings(&settings),
            Err(ProviderError::MissingApiKey(_))
        ));

        let settings = ProviderSettings {
            replicate_api_key: Some("r8_key".into()),
            ..Default::default()
        };
        let client = ReplicateClient::from_settings(&settings)
            .unwrap()
            .with_base_url("http://localhost:5000/v1/");
        assert_eq!(client.base_url(), "http://localhost:5000/v1");
    }

    #[test]
    fn test_bearer_header() {
        let headers = bearer_headers("r8_key").unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer r8_key");
        assert!(bearer_headers("bad\nkey").is_err());
    }
}
