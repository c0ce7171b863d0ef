// Validated file uploads stored on local disk

use crate::chat::error::{ChatError, ChatResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Default upload size limit (20 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

/// URL prefix uploaded files are served under
pub const UPLOADS_PREFIX: &str = "/uploads/";

/// Accepted MIME types and the extension used when serving them back
const ALLOWED_TYPES: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/webp", "webp"),
    ("image/gif", "gif"),
    ("video/mp4", "mp4"),
    ("video/webm", "webm"),
    ("application/pdf", "pdf"),
    ("application/zip", "zip"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "docx",
    ),
    ("application/msword", "doc"),
    ("text/plain", "txt"),
];

/// Metadata returned for a stored upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}

/// Whether uploads of this MIME type are accepted
pub fn is_allowed_type(mime: &str) -> bool {
    ALLOWED_TYPES.iter().any(|(allowed, _)| *allowed == mime)
}

/// Best-effort MIME type for a stored file name
fn mime_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("jpeg") => "image/jpeg",
        Some(ext) => ALLOWED_TYPES
            .iter()
            .find(|(_, known)| *known == ext)
            .map_or("application/octet-stream", |(mime, _)| *mime),
        None => "application/octet-stream",
    }
}

/// Extension kept from the client's file name, if it is sane
fn safe_extension(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Stored names are generated by us; anything else is refused
fn is_stored_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !name.contains("..")
}

/// Local-disk upload storage
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    max_bytes: u64,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Reject uploads by declared type and size before reading them
    pub fn validate(&self, mime: &str, size: u64) -> ChatResult<()> {
        if size == 0 {
            return Err(ChatError::NoFile);
        }
        if size > self.max_bytes {
            return Err(ChatError::FileTooLarge);
        }
        if !is_allowed_type(mime) {
            return Err(ChatError::UnsupportedFileType(mime.to_string()));
        }
        Ok(())
    }

    /// Store an upload under a fresh name
    pub async fn store(&self, file_name: &str, mime: &str, bytes: &[u8]) -> ChatResult<StoredFile> {
        self.validate(mime, bytes.len() as u64)?;

        let stored_name = match safe_extension(file_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(&stored_name), bytes).await?;

        tracing::info!("Stored upload {} ({} bytes, {})", stored_name, bytes.len(), mime);

        Ok(StoredFile {
            url: format!("{UPLOADS_PREFIX}{stored_name}"),
            file_name: file_name.to_string(),
            file_size: bytes.len() as u64,
            mime_type: mime.to_string(),
        })
    }

    /// Read back a stored upload and its MIME type
    pub async fn open(&self, stored_name: &str) -> ChatResult<(Vec<u8>, &'static str)> {
        if !is_stored_name(stored_name) {
            return Err(ChatError::NotFound);
        }

        match tokio::fs::read(self.dir.join(stored_name)).await {
            Ok(bytes) => Ok((bytes, mime_for(stored_name))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ChatError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}
