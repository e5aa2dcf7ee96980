//! In-memory fakes of the remote collaborators
//!
//! Available to this crate's unit tests and, through the `test-support`
//! feature, to integration tests and downstream crates.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{NodeEngineError, Result};
use crate::remote::{
    ChatClient, ChatRequest, FileClient, MediaSink, Prediction, PredictionClient,
    PredictionStatus, UploadedFile,
};

#[derive(Debug, Clone)]
struct Script {
    statuses: Vec<PredictionStatus>,
    output: Option<Value>,
    error: Option<String>,
}

#[derive(Debug)]
struct Tracked {
    model: String,
    polls: usize,
}

#[derive(Debug, Default)]
struct PredictionState {
    next_id: u32,
    predictions: HashMap<String, Tracked>,
    submissions: Vec<(String, Value)>,
    cancelled: Vec<String>,
    schema_requests: usize,
    status_requests: usize,
}

/// Scripted prediction backend
///
/// Unscripted models succeed on the first poll with a URL derived from the
/// prediction id. Scripted models walk their status sequence one poll at a
/// time, repeating the last status once the sequence is exhausted.
#[derive(Default)]
pub struct FakePredictionClient {
    schemas: HashMap<String, Value>,
    scripts: HashMap<String, Script>,
    rejections: HashMap<String, String>,
    state: Mutex<PredictionState>,
}

impl FakePredictionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `document` as the schema of `model_id` (`owner/name`)
    pub fn with_schema(mut self, model_id: &str, document: Value) -> Self {
        self.schemas.insert(model_id.to_string(), document);
        self
    }

    /// Jobs for `model` succeed after one processing poll with `output`
    pub fn with_output(mut self, model: &str, output: Value) -> Self {
        self.scripts.insert(
            model.to_string(),
            Script {
                statuses: vec![PredictionStatus::Processing, PredictionStatus::Succeeded],
                output: Some(output),
                error: None,
            },
        );
        self
    }

    /// Jobs for `model` fail after one processing poll with `message`
    pub fn with_failure(mut self, model: &str, message: &str) -> Self {
        self.scripts.insert(
            model.to_string(),
            Script {
                statuses: vec![PredictionStatus::Processing, PredictionStatus::Failed],
                output: None,
                error: Some(message.to_string()),
            },
        );
        self
    }

    /// Jobs for `model` report exactly these statuses
    pub fn with_status_sequence(mut self, model: &str, statuses: Vec<PredictionStatus>) -> Self {
        self.scripts.insert(
            model.to_string(),
            Script {
                statuses,
                output: None,
                error: None,
            },
        );
        self
    }

    /// Submissions for `model` are refused outright
    pub fn with_rejection(mut self, model: &str, message: &str) -> Self {
        self.rejections
            .insert(model.to_string(), message.to_string());
        self
    }

    /// Every `(model, input)` submitted, in order
    pub fn submissions(&self) -> Vec<(String, Value)> {
        self.state.lock().submissions.clone()
    }

    /// Prediction ids the engine asked to cancel
    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    pub fn schema_requests(&self) -> usize {
        self.state.lock().schema_requests
    }

    pub fn status_requests(&self) -> usize {
        self.state.lock().status_requests
    }
}

#[async_trait]
impl PredictionClient for FakePredictionClient {
    async fn create_prediction(&self, model: &str, input: Value) -> Result<Prediction> {
        if let Some(message) = self.rejections.get(model) {
            return Err(NodeEngineError::provider(message.clone()));
        }
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("pred-{}", state.next_id);
        state.submissions.push((model.to_string(), input));
        state.predictions.insert(
            id.clone(),
            Tracked {
                model: model.to_string(),
                polls: 0,
            },
        );
        Ok(Prediction::starting(id))
    }

    async fn get_prediction(&self, id: &str) -> Result<Prediction> {
        let mut state = self.state.lock();
        state.status_requests += 1;
        let tracked = state
            .predictions
            .get_mut(id)
            .ok_or_else(|| NodeEngineError::NotFound(format!("prediction '{}'", id)))?;
        tracked.polls += 1;

        let Some(script) = self.scripts.get(&tracked.model) else {
            return Ok(Prediction {
                id: id.to_string(),
                status: PredictionStatus::Succeeded,
                output: Some(Value::String(format!("https://fake.test/{}.png", id))),
                error: None,
                logs: None,
            });
        };

        let index = (tracked.polls - 1).min(script.statuses.len().saturating_sub(1));
        let status = script
            .statuses
            .get(index)
            .copied()
            .unwrap_or(PredictionStatus::Processing);
        Ok(Prediction {
            id: id.to_string(),
            status,
            output: (status == PredictionStatus::Succeeded)
                .then(|| script.output.clone())
                .flatten(),
            error: (status == PredictionStatus::Failed)
                .then(|| script.error.clone())
                .flatten(),
            logs: None,
        })
    }

    async fn cancel_prediction(&self, id: &str) -> Result<()> {
        self.state.lock().cancelled.push(id.to_string());
        Ok(())
    }

    async fn model_schema(&self, owner: &str, name: &str) -> Result<Value> {
        self.state.lock().schema_requests += 1;
        let model_id = format!("{}/{}", owner, name);
        self.schemas
            .get(&model_id)
            .cloned()
            .ok_or_else(|| NodeEngineError::NotFound(format!("model '{}'", model_id)))
    }
}

/// Chat backend answering with a fixed reply
pub struct FakeChatClient {
    reply: std::result::Result<String, String>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeChatClient {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatClient for FakeChatClient {
    async fn chat_completion(&self, request: ChatRequest) -> Result<String> {
        self.requests.lock().push(request);
        self.reply.clone().map_err(NodeEngineError::Provider)
    }
}

#[derive(Debug, Default)]
struct FileState {
    next_id: u32,
    uploads: Vec<PathBuf>,
    deletes: Vec<String>,
}

/// Remote file store keeping everything in memory
#[derive(Default)]
pub struct FakeFileClient {
    missing_urls: HashSet<String>,
    fail_deletes: bool,
    fail_uploads: bool,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
    state: Mutex<FileState>,
}

impl FakeFileClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existence probes for `url` report it as gone
    pub fn with_missing_url(mut self, url: &str) -> Self {
        self.missing_urls.insert(url.to_string());
        self
    }

    /// Every delete fails
    pub fn with_failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    /// Every upload fails
    pub fn with_failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    /// Uploaded files declare this expiry
    pub fn with_expiry(mut self, expires_at: chrono::DateTime<chrono::Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.state.lock().uploads.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state.lock().deletes.clone()
    }
}

#[async_trait]
impl FileClient for FakeFileClient {
    async fn upload_file(
        &self,
        path: &Path,
        _filename: &str,
        content_type: &str,
    ) -> Result<UploadedFile> {
        if self.fail_uploads {
            return Err(NodeEngineError::Upload(format!("{} rejected", path.display())));
        }
        let mut state = self.state.lock();
        state.next_id += 1;
        state.uploads.push(path.to_path_buf());
        let id = format!("file-{}", state.next_id);
        Ok(UploadedFile {
            url: format!("https://files.fake.test/{}", id),
            id,
            content_type: Some(content_type.to_string()),
            size: None,
            expires_at: self.expires_at,
        })
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.state.lock().deletes.push(file_id.to_string());
        if self.fail_deletes {
            return Err(NodeEngineError::Cleanup(format!("{} not deleted", file_id)));
        }
        Ok(())
    }

    async fn url_exists(&self, url: &str) -> Result<bool> {
        Ok(!self.missing_urls.contains(url))
    }
}

/// Download sink recording what it was asked to save
#[derive(Default)]
pub struct FakeMediaSink {
    saved: Mutex<Vec<String>>,
}

impl FakeMediaSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// URLs passed to `download_and_save`, in order
    pub fn saved(&self) -> Vec<String> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl MediaSink for FakeMediaSink {
    async fn download_and_save(
        &self,
        url: &str,
        filename: Option<&str>,
        folder: Option<&Path>,
    ) -> Result<PathBuf> {
        self.saved.lock().push(url.to_string());
        let folder = folder.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/downloads"));
        Ok(folder.join(filename.unwrap_or("output.png")))
    }
}
