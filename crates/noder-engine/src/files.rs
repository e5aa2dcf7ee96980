//! Remote file lifecycle
//!
//! Local media referenced by a node is uploaded to the provider's file store
//! on first use and cached per node. Changing the node's path supersedes the
//! cached upload (the old remote file is deleted). All remote deletes are best
//! effort: failures are logged, never raised to the run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::defaults;
use crate::error::{NodeEngineError, Result};
use crate::remote::{with_cancel, FileClient};
use crate::types::{DataKind, NodeId};

/// Upload cached for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_id: String,
    pub url: String,
    /// Local path the upload was made from
    pub file_path: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Whether `path` already points at something the provider can fetch
pub fn is_remote_reference(path: &str) -> bool {
    let lowered = path.trim_start().to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://") || lowered.starts_with("data:")
}

/// MIME type for an upload, from the file extension
pub fn content_type_for(path: &Path, kind: DataKind) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "txt" => "text/plain",
        _ => match kind {
            DataKind::Image => "image/png",
            DataKind::Video => "video/mp4",
            DataKind::Audio => "audio/mpeg",
            _ => "application/octet-stream",
        },
    }
}

/// Per-node cache of remote uploads
pub struct FileLifecycleManager {
    client: Arc<dyn FileClient>,
    entries: Mutex<HashMap<NodeId, FileInfo>>,
    expiry_buffer: chrono::Duration,
}

impl FileLifecycleManager {
    pub fn new(client: Arc<dyn FileClient>) -> Self {
        Self::with_expiry_buffer(client, defaults::LINK_EXPIRY_BUFFER_SECS)
    }

    /// Treat links expiring within `buffer_secs` as already expired
    pub fn with_expiry_buffer(client: Arc<dyn FileClient>, buffer_secs: i64) -> Self {
        Self {
            client,
            entries: Mutex::new(HashMap::new()),
            expiry_buffer: chrono::Duration::seconds(buffer_secs),
        }
    }

    /// Cached upload of a node
    pub fn get(&self, node_id: &str) -> Option<FileInfo> {
        self.entries.lock().get(node_id).cloned()
    }

    /// Number of cached uploads
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn expires_soon(&self, expires_at: Option<DateTime<Utc>>) -> bool {
        expires_at.is_some_and(|at| at - self.expiry_buffer <= Utc::now())
    }

    /// Return a URL the provider can fetch for `path`, uploading if needed
    ///
    /// Remote URLs and data URIs are returned unchanged. A cached upload of
    /// the same path is reused unless it is about to expire. Otherwise the
    /// file is uploaded and any earlier upload for this node is deleted.
    pub async fn ensure_uploaded(
        &self,
        node_id: &str,
        path: &str,
        kind: DataKind,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if is_remote_reference(path) {
            return Ok(path.to_string());
        }

        if let Some(cached) = self.get(node_id) {
            if cached.file_path == path && !self.expires_soon(cached.expires_at) {
                log::debug!("Reusing upload {} for node {}", cached.file_id, node_id);
                return Ok(cached.url);
            }
        }

        let local = Path::new(path);
        let filename = local
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload");
        let content_type = content_type_for(local, kind);

        let uploaded = with_cancel(cancel, self.client.upload_file(local, filename, content_type))
            .await
            .map_err(|e| match e {
                NodeEngineError::Upload(_) | NodeEngineError::Cancelled => e,
                other => NodeEngineError::Upload(other.to_string()),
            })?;
        log::info!("Uploaded {} for node {} as {}", path, node_id, uploaded.id);

        let info = FileInfo {
            file_id: uploaded.id,
            url: uploaded.url.clone(),
            file_path: path.to_string(),
            expires_at: uploaded.expires_at,
        };
        let previous = self.entries.lock().insert(node_id.to_string(), info);

        if let Some(previous) = previous {
            if let Err(e) = self.client.delete_file(&previous.file_id).await {
                log::warn!(
                    "Failed to delete superseded upload {} of node {}: {}",
                    previous.file_id,
                    node_id,
                    e
                );
            }
        }

        Ok(uploaded.url)
    }

    /// Delete and forget one node's upload
    pub async fn cleanup(&self, node_id: &str) -> Result<()> {
        let Some(info) = self.entries.lock().remove(node_id) else {
            return Ok(());
        };
        self.client
            .delete_file(&info.file_id)
            .await
            .map_err(|e| NodeEngineError::Cleanup(format!("{}: {}", info.file_id, e)))
    }

    /// Delete every cached upload; failures are logged and swallowed
    ///
    /// Returns how many remote files were deleted.
    pub async fn cleanup_all(&self) -> usize {
        let drained: Vec<(NodeId, FileInfo)> = self.entries.lock().drain().collect();
        if drained.is_empty() {
            return 0;
        }

        let deletions = drained.iter().map(|(node_id, info)| async move {
            match self.client.delete_file(&info.file_id).await {
                Ok(()) => true,
                Err(e) => {
                    log::warn!(
                        "Cleanup of {} (node {}) failed: {}",
                        info.file_id,
                        node_id,
                        e
                    );
                    false
                }
            }
        });
        let deleted = join_all(deletions).await.into_iter().filter(|ok| *ok).count();
        log::info!("Cleaned up {}/{} remote files", deleted, drained.len());
        deleted
    }

    /// Whether a remote link is still usable
    ///
    /// A link within the expiry buffer is invalid without probing; otherwise
    /// the provider is asked whether the URL still resolves.
    pub async fn is_link_valid(&self, url: &str, expires_at: Option<DateTime<Utc>>) -> bool {
        if self.expires_soon(expires_at) {
            return false;
        }
        match self.client.url_exists(url).await {
            Ok(exists) => exists,
            Err(e) => {
                log::debug!("Existence probe for {} failed: {}", url, e);
                false
            }
        }
    }
}
