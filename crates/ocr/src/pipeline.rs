use std::time::Duration;
use thiserror::Error;
use tillslip_core::StructuredReceipt;

use crate::extract::StructuredExtractor;
use crate::model::{LanguageModel, ModelError};
use crate::preprocess::{self, DecodeError};
use crate::recognizer::{OcrBackend, OcrError};
use crate::types::{Extraction, Stage};

/// Fewer meaningful characters than this and the OCR output is suspect.
const MIN_TEXT_CHARS: usize = 3;

pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a pipeline run produced no receipt. Each variant maps to one [`Stage`].
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Image decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("Text recognition failed: {0}")]
    Recognition(#[from] OcrError),
    #[error("Model call failed: {0}")]
    ModelCall(#[from] ModelError),
    #[error("Failed to parse model reply ({reason}): {reply}")]
    Parse { reason: String, reply: String },
}

impl ExtractionError {
    pub fn stage(&self) -> Stage {
        match self {
            ExtractionError::Decode(_) => Stage::Decode,
            ExtractionError::Recognition(_) => Stage::Recognition,
            ExtractionError::ModelCall(_) => Stage::ModelCall,
            ExtractionError::Parse { .. } => Stage::Parse,
        }
    }

    /// The unparsed model reply, for parse failures.
    pub fn raw_reply(&self) -> Option<&str> {
        match self {
            ExtractionError::Parse { reply, .. } => Some(reply),
            _ => None,
        }
    }
}

/// Orchestrates: normalize → recognize → extract.
///
/// Holds no per-run state, so one pipeline can serve concurrent runs. It
/// never stores anything: keeping the upload and the resulting record is the
/// caller's job.
pub struct ReceiptPipeline<R: OcrBackend, M: LanguageModel> {
    recognizer: R,
    extractor: StructuredExtractor<M>,
}

impl<R: OcrBackend, M: LanguageModel> ReceiptPipeline<R, M> {
    pub fn new(recognizer: R, model: M) -> Self {
        Self::with_timeout(recognizer, model, DEFAULT_MODEL_TIMEOUT)
    }

    pub fn with_timeout(recognizer: R, model: M, model_timeout: Duration) -> Self {
        Self { recognizer, extractor: StructuredExtractor::new(model, model_timeout) }
    }

    pub fn recognizer(&self) -> &R {
        &self.recognizer
    }

    pub fn model(&self) -> &M {
        self.extractor.model()
    }

    /// Run all stages over raw image bytes.
    pub async fn run(&self, data: &[u8]) -> Result<StructuredReceipt, ExtractionError> {
        self.process(data).await.map(|e| e.receipt)
    }

    /// Like [`run`](Self::run) but also returns the OCR text and threshold.
    #[tracing::instrument(name = "receipt_pipeline", skip_all, fields(bytes = data.len()))]
    pub async fn process(&self, data: &[u8]) -> Result<Extraction, ExtractionError> {
        let result = self.stages(data).await;
        if let Err(e) = &result {
            tracing::warn!(stage = %e.stage(), "Receipt extraction failed: {e}");
        }
        result
    }

    async fn stages(&self, data: &[u8]) -> Result<Extraction, ExtractionError> {
        let image = preprocess::normalize(data)?;
        let threshold = image.threshold();

        let ocr_text = self.recognizer.recognize(&image)?;
        drop(image);

        if is_near_empty(&ocr_text) {
            tracing::warn!(
                chars = ocr_text.len(),
                "OCR produced little or no text; forwarding to model anyway"
            );
        } else {
            tracing::debug!(chars = ocr_text.len(), "OCR complete");
        }

        let receipt = self.extractor.extract(&ocr_text).await?;
        Ok(Extraction { receipt, ocr_text, threshold })
    }
}

fn is_near_empty(text: &str) -> bool {
    text.chars().filter(|c| c.is_alphanumeric()).count() < MIN_TEXT_CHARS
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockModel;
    use crate::recognizer::{MockRecognizer, UnavailableRecognizer};
    use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::Arc;

    fn receipt_png() -> Vec<u8> {
        // Dark "text" stripes on a light background.
        let img: GrayImage =
            ImageBuffer::from_fn(64, 32, |_, y| Luma([if y % 8 < 2 { 30 } else { 220 }]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn pipeline(
        text: &str,
        model: MockModel,
    ) -> (ReceiptPipeline<Arc<MockRecognizer>, Arc<MockModel>>, Arc<MockRecognizer>, Arc<MockModel>)
    {
        let recognizer = Arc::new(MockRecognizer::new(text));
        let model = Arc::new(model);
        (ReceiptPipeline::new(recognizer.clone(), model.clone()), recognizer, model)
    }

    #[tokio::test]
    async fn clear_receipt_yields_model_structure() {
        let expected = json!({
            "total": 12.5,
            "business": "Cafe",
            "items": [{"name": "Coffee", "price": 3.5, "quantity": 1}],
            "address": "123 Main St"
        });
        let (p, recognizer, model) =
            pipeline("CAFE\n123 Main St\nCoffee 3.50\nTOTAL 12.50", MockModel::replying(expected.to_string()));

        let receipt = p.run(&receipt_png()).await.unwrap();

        assert_eq!(receipt.clone().into_value(), expected);
        assert_eq!(receipt.business(), Some("Cafe"));
        assert_eq!(recognizer.calls(), 1);
        let prompts = model.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].ends_with("CAFE\n123 Main St\nCoffee 3.50\nTOTAL 12.50"));
    }

    #[tokio::test]
    async fn empty_bytes_stop_before_recognition() {
        let (p, recognizer, model) = pipeline("unused", MockModel::replying("{}"));

        let err = p.run(&[]).await.unwrap_err();

        assert_eq!(err.stage(), Stage::Decode);
        assert!(matches!(err, ExtractionError::Decode(DecodeError::Empty)));
        assert_eq!(recognizer.calls(), 0);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn gibberish_declined_by_model_is_parse_error() {
        let (p, _, model) = pipeline("~~ #@ ,,", MockModel::replying("cannot extract"));

        let err = p.run(&receipt_png()).await.unwrap_err();

        assert_eq!(err.stage(), Stage::Parse);
        assert!(err.to_string().contains("cannot extract"));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn fenced_reply_is_unwrapped() {
        let (p, _, _) = pipeline("TOTAL 5.00", MockModel::replying("```json\n{\"total\":5}\n```"));
        let receipt = p.run(&receipt_png()).await.unwrap();
        assert_eq!(receipt.into_value(), json!({"total": 5}));
    }

    #[tokio::test]
    async fn model_failure_is_model_call_stage() {
        let (p, _, _) = pipeline("TOTAL 5.00", MockModel::failing("network down"));
        let err = p.run(&receipt_png()).await.unwrap_err();
        assert_eq!(err.stage(), Stage::ModelCall);
        assert_eq!(err.raw_reply(), None);
    }

    #[tokio::test]
    async fn engine_fault_is_recognition_stage() {
        let model = Arc::new(MockModel::replying("{}"));
        let p = ReceiptPipeline::new(UnavailableRecognizer, model.clone());
        let err = p.run(&receipt_png()).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Recognition);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn empty_ocr_text_still_reaches_model() {
        let (p, _, model) = pipeline("", MockModel::replying("unreadable"));
        let err = p.run(&receipt_png()).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Parse);
        assert_eq!(model.prompts(), vec![crate::extract::build_prompt("")]);
    }

    #[tokio::test]
    async fn process_reports_diagnostics() {
        let (p, _, _) = pipeline("TOTAL 5.00", MockModel::replying("{\"total\":5}"));
        let extraction = p.process(&receipt_png()).await.unwrap();
        assert_eq!(extraction.ocr_text, "TOTAL 5.00");
        assert!(extraction.threshold > 30 && extraction.threshold <= 220);
    }

    #[tokio::test]
    async fn concurrent_runs_share_one_pipeline() {
        let (p, recognizer, _) = pipeline("TOTAL 5.00", MockModel::replying("{\"total\":5}"));
        let p = Arc::new(p);
        let png = Arc::new(receipt_png());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                let png = png.clone();
                tokio::spawn(async move { p.run(&png).await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().into_value(), json!({"total": 5}));
        }
        assert_eq!(recognizer.calls(), 4);
    }

    #[test]
    fn near_empty_detection() {
        assert!(is_near_empty(""));
        assert!(is_near_empty(" \n\t-- ~"));
        assert!(is_near_empty("a."));
        assert!(!is_near_empty("TOTAL 5"));
    }
}
