//! On-disk layout of the media root
//!
//! ```text
//! <root>/<key>.<fmt>        finished file
//! <root>/<key>.json         metadata sidecar
//! <root>/<key>.part.<fmt>   transcoder output before the final rename
//! <root>/.work/job-*/       per-job scratch directories
//! ```

use super::error::MediaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const WORK_DIR: &str = ".work";
const SIDECAR_EXT: &str = "json";
const PART_MARKER: &str = ".part.";

/// Length of a media key in hex characters
pub const KEY_LEN: usize = 16;

/// Metadata written next to every finished file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub key: String,
    pub file: String,
    pub title: Option<String>,
    pub source: String,
    pub extractor_id: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub format: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Entry returned by `GET /media`
#[derive(Debug, Clone, Serialize)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Content address for a conversion source
pub fn media_key(source: &str) -> String {
    let digest = Sha256::digest(source.trim().as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(KEY_LEN);
    key
}

/// Content type for a stored file, by extension
pub fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("mp4a") => "audio/mp4",
        Some("opus") | Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("webm") => "audio/webm",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Decode and check a file name taken from a request path
///
/// Only plain names directly under the root are accepted.
pub fn validate_file_name(raw: &str) -> Result<String, MediaError> {
    let decoded = urlencoding::decode(raw).map_err(|_| MediaError::InvalidFileName)?;
    let name = decoded.into_owned();

    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.contains("..");

    if invalid {
        return Err(MediaError::InvalidFileName);
    }
    Ok(name)
}

fn is_listed(name: &str) -> bool {
    !name.starts_with('.')
        && !name.contains(PART_MARKER)
        && Path::new(name).extension().and_then(|e| e.to_str()) != Some(SIDECAR_EXT)
}

/// In-progress output, deleted on drop unless persisted
#[derive(Debug)]
pub struct PartFile {
    path: PathBuf,
    persisted: bool,
}

impl PartFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the finished file into place
    pub async fn persist(mut self, dest: &Path) -> Result<(), MediaError> {
        tokio::fs::rename(&self.path, dest).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed unfinished output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove unfinished output")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
    work: PathBuf,
}

impl MediaStore {
    /// Prepare the media root: create it if needed and prove it is writable
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, MediaError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let work = root.join(WORK_DIR);
        std::fs::create_dir_all(&work)?;

        // Dropping the probe removes it again
        let probe = tempfile::Builder::new()
            .prefix(".write-probe-")
            .tempfile_in(&root)?;
        drop(probe);

        debug!(root = %root.display(), "Media root is writable");
        Ok(Self { root, work })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(key: &str, format: &str) -> String {
        format!("{}.{}", key, format)
    }

    pub fn output_path(&self, key: &str, format: &str) -> PathBuf {
        self.root.join(Self::file_name(key, format))
    }

    pub fn part_path(&self, key: &str, format: &str) -> PathBuf {
        self.root.join(format!("{}{}{}", key, PART_MARKER, format))
    }

    /// Claim the part path for a conversion in progress
    pub fn part_file(&self, key: &str, format: &str) -> PartFile {
        PartFile {
            path: self.part_path(key, format),
            persisted: false,
        }
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, SIDECAR_EXT))
    }

    /// Fresh scratch directory, removed when the handle is dropped
    pub fn work_dir(&self) -> Result<tempfile::TempDir, MediaError> {
        Ok(tempfile::Builder::new().prefix("job-").tempdir_in(&self.work)?)
    }

    /// Size of a finished file, if it exists
    pub async fn existing_size(&self, key: &str, format: &str) -> Option<u64> {
        tokio::fs::metadata(self.output_path(key, format))
            .await
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    /// Path of a stored file by its public name
    pub async fn resolve(&self, raw_name: &str) -> Result<PathBuf, MediaError> {
        let name = validate_file_name(raw_name)?;
        if !is_listed(&name) {
            return Err(MediaError::NotFound(name));
        }
        let path = self.root.join(&name);
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => Ok(path),
            _ => Err(MediaError::NotFound(name)),
        }
    }

    pub async fn read_info(&self, key: &str) -> Option<MediaInfo> {
        let bytes = tokio::fs::read(self.sidecar_path(key)).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(key, error = %e, "Ignoring unreadable media sidecar");
                None
            }
        }
    }

    pub async fn write_info(&self, info: &MediaInfo) -> Result<(), MediaError> {
        let bytes = serde_json::to_vec_pretty(info)?;
        tokio::fs::write(self.sidecar_path(&info.key), bytes).await?;
        Ok(())
    }

    /// Finished files, sorted by name
    pub async fn list(&self) -> Result<Vec<StoredFile>, MediaError> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_listed(&name) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            files.push(StoredFile {
                name,
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
