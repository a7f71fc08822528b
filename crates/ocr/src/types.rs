use serde_json::Value;
use tillslip_core::StructuredReceipt;

/// The pipeline stage at which a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Decode,
    Recognition,
    ModelCall,
    Parse,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Decode => write!(f, "decode"),
            Stage::Recognition => write!(f, "recognition"),
            Stage::ModelCall => write!(f, "model_call"),
            Stage::Parse => write!(f, "parse"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decode" => Ok(Stage::Decode),
            "recognition" => Ok(Stage::Recognition),
            "model_call" => Ok(Stage::ModelCall),
            "parse" => Ok(Stage::Parse),
            other => Err(format!("Unknown pipeline stage: '{other}'")),
        }
    }
}

/// Everything a successful run produced, for callers that keep diagnostics.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub receipt: StructuredReceipt,
    /// Raw OCR output that was sent to the model.
    pub ocr_text: String,
    /// Otsu threshold chosen while binarizing the image.
    pub threshold: u8,
}

/// Short name of a JSON value's type, for error messages.
pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
