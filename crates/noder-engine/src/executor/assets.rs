//! Handlers that resolve without polling: media, chip, save

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{ExecutionContext, NodeHandler, NodeTask};
use crate::error::{NodeEngineError, Result};
use crate::files::is_remote_reference;
use crate::types::{DataKind, GraphNode, HandleId, NodeOutputs, PortValue, OUTPUT_HANDLE};

fn single_output(value: PortValue) -> NodeOutputs {
    let mut outputs = NodeOutputs::new();
    outputs.insert(OUTPUT_HANDLE.to_string(), value);
    outputs
}

/// Media kind declared on a media node, guessed from the path otherwise
fn media_kind(node: &GraphNode, path: Option<&str>) -> DataKind {
    if let Some(kind) = node.data_str("mediaType").and_then(DataKind::from_media_hint) {
        return kind;
    }
    let extension = path
        .and_then(|p| Path::new(p.split('?').next().unwrap_or(p)).extension())
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "mp4" | "webm" | "mov" | "mkv" => DataKind::Video,
        "mp3" | "wav" | "ogg" | "flac" | "m4a" => DataKind::Audio,
        _ => DataKind::Image,
    }
}

/// Local or uploaded assets
///
/// A remote URL cached on the node (`data.fileUrl`) wins over the local path
/// unless it is known to expire. Local paths are uploaded through the file
/// manager when one is configured; a failed upload falls back to the path.
pub struct MediaHandler;

#[async_trait]
impl NodeHandler for MediaHandler {
    async fn execute(&self, task: &NodeTask<'_>, ctx: &ExecutionContext) -> Result<NodeOutputs> {
        let node = task.node;
        let local = node
            .data_str("mediaPath")
            .or_else(|| node.data_str("filePath"));
        let cached_url = node.data_str("fileUrl");
        let kind = media_kind(node, local.or(cached_url));

        if let Some(url) = cached_url {
            let expires_at = node
                .data_str("fileExpiresAt")
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            let usable = match (&ctx.files, expires_at) {
                (Some(files), Some(_)) => files.is_link_valid(url, expires_at).await,
                _ => true,
            };
            if usable || local.is_none() {
                return Ok(single_output(PortValue::new(kind, url)));
            }
            log::debug!("Cached link of node {} expired, re-uploading", node.id);
        }

        let path = local.ok_or_else(|| {
            NodeEngineError::MissingInput("No media file selected".to_string())
        })?;

        let Some(files) = ctx.files.as_ref().filter(|_| !is_remote_reference(path)) else {
            return Ok(single_output(PortValue::new(kind, path)));
        };

        let value = match files.ensure_uploaded(&node.id, path, kind, task.cancel).await {
            Ok(url) => {
                let mut metadata = Map::new();
                metadata.insert("localPath".to_string(), Value::String(path.to_string()));
                if let Some(info) = files.get(&node.id) {
                    metadata.insert("fileId".to_string(), Value::String(info.file_id));
                }
                PortValue::new(kind, url).with_metadata(metadata)
            }
            Err(NodeEngineError::Cancelled) => return Err(NodeEngineError::Cancelled),
            Err(e) => {
                log::warn!("Upload for node {} failed, using local path: {}", node.id, e);
                PortValue::new(kind, path)
            }
        };
        Ok(single_output(value))
    }
}

/// Chip nodes emit their literal content for placeholder substitution
pub struct ChipHandler;

#[async_trait]
impl NodeHandler for ChipHandler {
    async fn execute(&self, task: &NodeTask<'_>, _ctx: &ExecutionContext) -> Result<NodeOutputs> {
        let node = task.node;
        let chip_id = match node.data_str("chipId") {
            Some(id) => id.to_string(),
            None => {
                log::debug!("Chip node {} has no chipId, using node id", node.id);
                node.id.clone()
            }
        };
        let content = node
            .data
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(single_output(PortValue::chip(chip_id, content)))
    }
}

/// First non-empty connected value, scanning handles in name order
fn first_saveable(task: &NodeTask<'_>) -> Option<(DataKind, String)> {
    let mut handles: Vec<&HandleId> = task.inputs.keys().collect();
    handles.sort();
    handles
        .into_iter()
        .flat_map(|h| task.inputs[h].values())
        .filter(|v| !v.is_chip && !v.is_empty())
        .find_map(|v| {
            let url = match &v.value {
                Value::String(s) => Some(s.clone()),
                Value::Array(items) => items.iter().find_map(Value::as_str).map(str::to_string),
                _ => None,
            };
            url.map(|u| (v.kind, u))
        })
}

/// Save nodes persist their first connected asset to disk
pub struct SaveHandler;

#[async_trait]
impl NodeHandler for SaveHandler {
    async fn execute(&self, task: &NodeTask<'_>, ctx: &ExecutionContext) -> Result<NodeOutputs> {
        let node = task.node;
        let (kind, url) = first_saveable(task)
            .ok_or_else(|| NodeEngineError::MissingInput("No media to save".to_string()))?;

        let sink = ctx
            .media_sink
            .as_ref()
            .ok_or_else(|| NodeEngineError::failed("No media sink configured"))?;

        let folder = node
            .data_str("saveLocation")
            .or_else(|| node.data_str("destinationFolder"))
            .map(PathBuf::from);
        let filename = node.data_str("filename");

        let saved = crate::remote::with_cancel(
            task.cancel,
            sink.download_and_save(&url, filename, folder.as_deref()),
        )
        .await?;
        log::info!("Node {} saved {} to {}", node.id, url, saved.display());

        let mut metadata = Map::new();
        metadata.insert("sourceUrl".to_string(), Value::String(url));
        Ok(single_output(
            PortValue::new(kind, saved.to_string_lossy().into_owned()).with_metadata(metadata),
        ))
    }
}
