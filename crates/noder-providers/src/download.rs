//! Saving generated assets to disk

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use noder_engine::MediaSink;

use crate::error::{ProviderError, Result};
use crate::replicate::{bearer_headers, is_provider_hosted};
use crate::settings::{configured, ProviderSettings};

const FALLBACK_EXTENSION: &str = "png";

/// Replace anything outside `[A-Za-z0-9_-]` (and spaces, if allowed) with `_`
fn sanitize_segment(input: &str, allow_spaces: bool) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || (allow_spaces && ch == ' ') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn sanitize_extension(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Filesystem-safe version of a user-supplied file name
///
/// The stem falls back to `file` when nothing usable is left; the extension
/// keeps only alphanumerics.
pub fn sanitize_filename(input: &str) -> String {
    let path = Path::new(input);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

    let stem = sanitize_segment(stem, true);
    let stem = if stem.is_empty() { "file".to_string() } else { stem };
    let extension = sanitize_extension(extension);

    if extension.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, extension)
    }
}

/// Relative path with `.`/`..` and empty segments dropped and each segment sanitized
pub fn sanitize_relative_path(input: &str) -> PathBuf {
    input
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(|s| sanitize_segment(s, true))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Extension of the last path segment of `url`, ignoring query and fragment
pub fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    let (_, extension) = last.rsplit_once('.')?;
    let extension = sanitize_extension(extension);
    (!extension.is_empty()).then_some(extension)
}

/// `noder-output-<unix ts>.<ext>`
pub fn default_output_name(url: &str, timestamp: i64) -> String {
    let extension = url_extension(url).unwrap_or_else(|| FALLBACK_EXTENSION.to_string());
    sanitize_filename(&format!("noder-output-{}.{}", timestamp, extension))
}

/// Downloads outputs into a local folder
pub struct LocalMediaSaver {
    http: reqwest::Client,
    base_folder: PathBuf,
    provider_token: Option<String>,
}

impl LocalMediaSaver {
    pub fn new(base_folder: impl Into<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_folder: base_folder.into(),
            provider_token: None,
        }
    }

    /// Saves under the configured location, otherwise `<downloads>/noder`
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let base_folder = configured(&settings.default_save_location)
            .map(PathBuf::from)
            .or_else(|| dirs::download_dir().map(|dir| dir.join("noder")))
            .unwrap_or_else(|| PathBuf::from("noder"));
        let mut saver = Self::new(base_folder);
        saver.provider_token = configured(&settings.replicate_api_key).map(str::to_string);
        saver
    }

    pub fn base_folder(&self) -> &Path {
        &self.base_folder
    }

    /// Where a save into `folder` lands
    ///
    /// Absolute folders are used as given; relative ones are sanitized and
    /// placed under the base folder.
    pub fn resolve_folder(&self, folder: Option<&Path>) -> PathBuf {
        let Some(folder) = folder else {
            return self.base_folder.clone();
        };
        if folder.is_absolute() {
            return folder.to_path_buf();
        }
        let relative = sanitize_relative_path(&folder.to_string_lossy());
        if relative.as_os_str().is_empty() {
            self.base_folder.clone()
        } else {
            self.base_folder.join(relative)
        }
    }

    /// Write `bytes` to `folder/filename`, creating the folder on demand
    pub async fn write_output(folder: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(folder).await?;
        let path = folder.join(filename);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut request = self.http.get(url);
        if is_provider_hosted(url) {
            let token = self
                .provider_token
                .as_deref()
                .ok_or_else(|| ProviderError::MissingApiKey("Replicate".to_string()))?;
            request = request.headers(bearer_headers(token)?);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn save(&self, url: &str, filename: Option<&str>, folder: Option<&Path>) -> Result<PathBuf> {
        let bytes = self.fetch(url).await?;
        let filename = match filename.map(str::trim).filter(|f| !f.is_empty()) {
            Some(name) => sanitize_filename(name),
            None => default_output_name(url, Utc::now().timestamp()),
        };
        let path = Self::write_output(&self.resolve_folder(folder), &filename, &bytes).await?;
        log::info!("Saved {} to {}", url, path.display());
        Ok(path)
    }
}

#[async_trait]
impl MediaSink for LocalMediaSaver {
    async fn download_and_save(
        &self,
        url: &str,
        filename: Option<&str>,
        folder: Option<&Path>,
    ) -> noder_engine::Result<PathBuf> {
        Ok(self.save(url, filename, folder).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my render.png"), "my render.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("weird*name?.we.bp"), "weird_name__we.bp");
        assert_eq!(sanitize_filename("???.p-n-g"), "___.png");
        assert_eq!(sanitize_filename(".mp4"), "_mp4");
        assert_eq!(sanitize_filename(""), "file");
    }

    #[test]
    fn test_sanitize_relative_path_drops_traversal() {
        assert_eq!(
            sanitize_relative_path("../renders/./2026\\oct"),
            PathBuf::from("renders").join("2026").join("oct")
        );
        assert!(sanitize_relative_path("../..").as_os_str().is_empty());
    }

    #[test]
    fn test_default_name_uses_url_extension() {
        assert_eq!(
            default_output_name("https://replicate.delivery/abc/out-0.webp?x=1", 1700000000),
            "noder-output-1700000000.webp"
        );
        assert_eq!(
            default_output_name("https://api.replicate.com/v1/files/abc/download", 42),
            "noder-output-42.png"
        );
        assert_eq!(url_extension("https://cdn.example.com/a.b/video"), None);
    }

    #[test]
    fn test_resolve_folder() {
        let saver = LocalMediaSaver::new("/data/noder");
        assert_eq!(saver.resolve_folder(None), PathBuf::from("/data/noder"));
        assert_eq!(
            saver.resolve_folder(Some(Path::new("shots/../day1"))),
            PathBuf::from("/data/noder/shots/day1")
        );
        assert_eq!(
            saver.resolve_folder(Some(Path::new(".."))),
            PathBuf::from("/data/noder")
        );
        assert_eq!(
            saver.resolve_folder(Some(Path::new("/tmp/elsewhere"))),
            PathBuf::from("/tmp/elsewhere")
        );
    }

    #[test]
    fn test_from_settings_prefers_configured_location() {
        let saver = LocalMediaSaver::from_settings(&ProviderSettings {
            default_save_location: Some("/srv/outputs".into()),
            ..Default::default()
        });
        assert_eq!(saver.base_folder(), Path::new("/srv/outputs"));
    }

    #[tokio::test]
    async fn test_write_output_creates_folder() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("nested").join("out");
        let path = LocalMediaSaver::write_output(&folder, "a.png", b"png-bytes")
            .await
            .unwrap();
        assert_eq!(path, folder.join("a.png"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_provider_hosted_download_needs_token() {
        let dir = tempfile::tempdir().unwrap();
        let saver = LocalMediaSaver::new(dir.path());
        let err = saver
            .download_and_save("https://api.replicate.com/v1/files/f1/download", None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Replicate API key not configured"));
    }
}
