use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::intake::{IntakeError, ReceiptRecord};

/// Where an uploaded image was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// SHA-256 hex digest of the original bytes.
    pub hash: String,
    pub path: PathBuf,
}

/// File extension to store an upload under: lowercase, alphanumeric, or `bin`.
pub fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    if !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        ext
    } else {
        "bin".to_string()
    }
}

fn content_hash(data: &[u8]) -> String {
    Sha256::digest(data).iter().map(|b| format!("{b:02x}")).collect()
}

/// Write through a sibling temp file so readers never see a partial file.
async fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("upload");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Keeps original uploads under `<data>/attachments` and extraction records
/// under `<data>/records`.
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    attachments_dir: PathBuf,
    records_dir: PathBuf,
}

impl ReceiptStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            attachments_dir: data_dir.join("attachments"),
            records_dir: data_dir.join("records"),
        }
    }

    /// `attachments/<first two hex chars>/<hash>.<ext>`
    fn image_path(&self, hash: &str, ext: &str) -> PathBuf {
        self.attachments_dir.join(&hash[..2]).join(format!("{hash}.{ext}"))
    }

    /// Store image bytes under their content hash. Identical uploads share a file.
    ///
    /// An existing file is reused only if its bytes still hash to `hash`;
    /// a truncated or corrupted copy is replaced.
    pub async fn put_image(&self, data: &[u8], ext: &str) -> io::Result<ImageRef> {
        let hash = content_hash(data);
        let path = self.image_path(&hash, &normalize_ext(ext));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if stored_copy_matches(&path, &hash).await? {
            tracing::debug!("Image already stored: {}", path.display());
        } else {
            write_atomically(&path, data).await?;
        }
        Ok(ImageRef { hash, path })
    }

    pub fn record_path(&self, id: &Uuid) -> PathBuf {
        self.records_dir.join(format!("{id}.json"))
    }

    pub async fn save_record(&self, record: &ReceiptRecord) -> Result<PathBuf, IntakeError> {
        tokio::fs::create_dir_all(&self.records_dir).await?;
        let path = self.record_path(&record.id);
        let json = serde_json::to_vec_pretty(record)?;
        write_atomically(&path, &json).await?;
        Ok(path)
    }

    pub async fn load_record(&self, id: &Uuid) -> Result<ReceiptRecord, IntakeError> {
        let bytes = tokio::fs::read(self.record_path(id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All stored records, oldest first, optionally only those of `user_id`.
    ///
    /// Files that do not parse as a record are skipped with a warning.
    pub async fn list_records(&self, user_id: Option<&str>) -> Result<Vec<ReceiptRecord>, IntakeError> {
        let mut entries = match tokio::fs::read_dir(&self.records_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ReceiptRecord>(&bytes) {
                Ok(record) if user_id.map_or(true, |u| record.user_id == u) => records.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping unreadable record {}: {e}", path.display()),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

async fn stored_copy_matches(path: &Path, hash: &str) -> io::Result<bool> {
    match tokio::fs::read(path).await {
        Ok(existing) => Ok(content_hash(&existing) == hash),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
