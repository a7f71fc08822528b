use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tillslip_core::OcrConfig;

use crate::preprocess::NormalizedImage;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Failed to hand image to OCR engine: {0}")]
    ImageTransfer(String),
    #[error("OCR engine error: {0}")]
    Engine(String),
    #[error("Tesseract not available: build with `tesseract` feature")]
    NotAvailable,
}

/// Abstraction over an OCR backend.
///
/// An unreadable image is not an error: backends return empty or garbled
/// text and leave the judgement to the caller. `Err` is reserved for engine
/// faults.
pub trait OcrBackend: Send + Sync {
    fn recognize(&self, image: &NormalizedImage) -> Result<String, OcrError>;
}

impl<T: OcrBackend + ?Sized> OcrBackend for Box<T> {
    fn recognize(&self, image: &NormalizedImage) -> Result<String, OcrError> {
        (**self).recognize(image)
    }
}

impl<T: OcrBackend + ?Sized> OcrBackend for Arc<T> {
    fn recognize(&self, image: &NormalizedImage) -> Result<String, OcrError> {
        (**self).recognize(image)
    }
}

/// Pick the OCR backend this build supports.
#[cfg(feature = "tesseract")]
pub fn default_backend(config: &OcrConfig) -> Box<dyn OcrBackend> {
    Box::new(tesseract_backend::TesseractRecognizer::new(
        config.tesseract_data_path.clone(),
        &config.language,
    ))
}

/// Pick the OCR backend this build supports.
#[cfg(not(feature = "tesseract"))]
pub fn default_backend(_config: &OcrConfig) -> Box<dyn OcrBackend> {
    Box::new(UnavailableRecognizer)
}

/// Stands in when no OCR engine was compiled in; every call fails.
pub struct UnavailableRecognizer;

impl OcrBackend for UnavailableRecognizer {
    fn recognize(&self, _image: &NormalizedImage) -> Result<String, OcrError> {
        Err(OcrError::NotAvailable)
    }
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns a pre-set string, for testing the pipeline without
/// Tesseract installed. Counts how often it was asked.
pub struct MockRecognizer {
    pub text: String,
    calls: AtomicUsize,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrBackend for MockRecognizer {
    fn recognize(&self, _image: &NormalizedImage) -> Result<String, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.clone())
    }
}

// ── Tesseract backend (optional, gated behind `tesseract` feature) ─────────────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{OcrBackend, OcrError};
    use crate::preprocess::NormalizedImage;
    use leptess::LepTess;

    pub struct TesseractRecognizer {
        data_path: Option<String>,
        lang: String,
    }

    impl TesseractRecognizer {
        pub fn new(data_path: Option<String>, lang: &str) -> Self {
            Self { data_path, lang: lang.to_string() }
        }
    }

    impl OcrBackend for TesseractRecognizer {
        fn recognize(&self, image: &NormalizedImage) -> Result<String, OcrError> {
            let png = image
                .to_png()
                .map_err(|e| OcrError::ImageTransfer(e.to_string()))?;
            // A fresh engine per call: LepTess is not Sync.
            let mut lt = LepTess::new(self.data_path.as_deref(), &self.lang)
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            lt.set_image_from_mem(&png)
                .map_err(|e| OcrError::ImageTransfer(e.to_string()))?;
            lt.get_utf8_text().map_err(|e| OcrError::Engine(e.to_string()))
        }
    }
}
