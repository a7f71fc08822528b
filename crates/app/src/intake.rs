use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tillslip_core::StructuredReceipt;
use tillslip_ocr::{ExtractionError, LanguageModel, OcrBackend, ReceiptPipeline};
use uuid::Uuid;

use crate::store::{ImageRef, ReceiptStore};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Upload is empty")]
    EmptyUpload,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The image was stored but no record was created.
    #[error("Extraction failed at {} stage; image kept at {}: {source}", .source.stage(), .image.path.display())]
    Extraction {
        image: ImageRef,
        #[source]
        source: ExtractionError,
    },
}

/// A stored extraction result, tied to its user and original image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub id: Uuid,
    pub user_id: String,
    pub image: ImageRef,
    pub created_at: DateTime<Utc>,
    pub ocr_text: String,
    pub receipt: StructuredReceipt,
}

/// Store-then-process: the upload is persisted before the pipeline runs, so a
/// failed extraction never loses the user's image.
pub struct Intake<R: OcrBackend, M: LanguageModel> {
    pipeline: ReceiptPipeline<R, M>,
    store: ReceiptStore,
}

impl<R: OcrBackend, M: LanguageModel> Intake<R, M> {
    pub fn new(pipeline: ReceiptPipeline<R, M>, store: ReceiptStore) -> Self {
        Self { pipeline, store }
    }

    pub async fn ingest_file(&self, user_id: &str, path: &Path) -> Result<ReceiptRecord, IntakeError> {
        let bytes = tokio::fs::read(path).await?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        self.ingest(user_id, &bytes, ext).await
    }

    pub async fn ingest(&self, user_id: &str, data: &[u8], ext: &str) -> Result<ReceiptRecord, IntakeError> {
        if data.is_empty() {
            return Err(IntakeError::EmptyUpload);
        }

        let image = self.store.put_image(data, ext).await?;
        tracing::debug!(hash = %image.hash, "Upload stored");

        let extraction = match self.pipeline.process(data).await {
            Ok(extraction) => extraction,
            Err(source) => return Err(IntakeError::Extraction { image, source }),
        };

        let record = ReceiptRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            image,
            created_at: Utc::now(),
            ocr_text: extraction.ocr_text,
            receipt: extraction.receipt,
        };
        let path = self.store.save_record(&record).await?;
        tracing::info!(record = %record.id, user = %record.user_id, "Receipt stored: {}", path.display());
        Ok(record)
    }
}
