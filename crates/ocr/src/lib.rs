pub mod extract;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod types;

pub use extract::{build_prompt, parse_reply, strip_code_fences, StructuredExtractor};
pub use model::{GeminiModel, LanguageModel, MockModel, ModelError};
pub use pipeline::{ExtractionError, ReceiptPipeline, DEFAULT_MODEL_TIMEOUT};
pub use preprocess::{normalize, otsu_threshold, DecodeError, NormalizedImage};
pub use recognizer::{default_backend, MockRecognizer, OcrBackend, OcrError, UnavailableRecognizer};
pub use tillslip_core::{LineItem, StructuredReceipt};
pub use types::{Extraction, Stage};
