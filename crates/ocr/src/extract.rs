use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tillslip_core::StructuredReceipt;

use crate::model::{LanguageModel, ModelError};
use crate::pipeline::ExtractionError;
use crate::types::json_kind;

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// A fenced block somewhere inside a longer reply.
re!(re_fenced_block, r"(?s)```[\w+.-]*[ \t]*\r?\n(.*?)\r?\n?```");

/// Instruction placed before the recognized text. The text follows verbatim.
pub const EXTRACTION_INSTRUCTION: &str = "You are a receipt parser. I am going to give you the text \
of a receipt. Extract the following information and reply with JSON in this structure: \
{\"total\", \"business\", \"items\": [{\"name\", \"price\", \"quantity\"}], \"address\"}. \
If you cannot extract the requested information from the text, respond with something short.\n\n";

/// Instruction followed by the recognized text, with no escaping.
pub fn build_prompt(text: &str) -> String {
    format!("{EXTRACTION_INSTRUCTION}{text}")
}

/// Remove the markdown code fence models like to wrap JSON in.
///
/// Handles a reply that is entirely a fenced block (with or without a
/// language tag, on one line or several) as well as a single fenced block
/// surrounded by prose. Only the fence markers, the tag and the line break
/// next to each marker are removed; the block body is returned as written.
/// Anything else is returned trimmed.
pub fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        return match rest.split_once('\n') {
            Some((tag, body)) if is_language_tag(tag) => {
                strip_line_break(strip_closing_fence(body))
            }
            _ => strip_closing_fence(strip_inline_tag(rest)),
        };
    }

    match re_fenced_block().captures(trimmed).and_then(|c| c.get(1)) {
        Some(block) => block.as_str(),
        None => trimmed,
    }
}

/// Body up to the closing fence; prose after it is dropped.
fn strip_closing_fence(body: &str) -> &str {
    match body.strip_suffix("```") {
        Some(inner) => inner,
        None => body.split_once("```").map_or(body, |(inner, _)| inner),
    }
}

fn strip_line_break(body: &str) -> &str {
    let body = body.strip_suffix('\n').unwrap_or(body);
    body.strip_suffix('\r').unwrap_or(body)
}

/// ```` ```json{...}``` ````: drop a tag glued to the opening fence when JSON follows it.
fn strip_inline_tag(rest: &str) -> &str {
    let tag_len = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    let after = rest[tag_len..].trim_start();
    if tag_len > 0 && after.starts_with(['{', '[']) {
        after
    } else {
        rest
    }
}

fn is_language_tag(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '.' | '-'))
}

/// Fence-strip `reply` and parse it as the receipt object.
///
/// Any JSON object is accepted unchanged. Other JSON values and invalid JSON
/// are parse failures that keep the whole raw reply.
pub fn parse_reply(reply: &str) -> Result<StructuredReceipt, ExtractionError> {
    let cleaned = strip_code_fences(reply);
    match serde_json::from_str::<Value>(cleaned) {
        Ok(Value::Object(fields)) => Ok(StructuredReceipt::from_object(fields)),
        Ok(other) => Err(ExtractionError::Parse {
            reason: format!("expected a JSON object, found {}", json_kind(&other)),
            reply: reply.to_string(),
        }),
        Err(e) => Err(ExtractionError::Parse { reason: e.to_string(), reply: reply.to_string() }),
    }
}

/// Turns recognized text into a [`StructuredReceipt`] via a language model.
pub struct StructuredExtractor<M> {
    model: M,
    timeout: Duration,
}

impl<M: LanguageModel> StructuredExtractor<M> {
    pub fn new(model: M, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub async fn extract(&self, text: &str) -> Result<StructuredReceipt, ExtractionError> {
        let prompt = build_prompt(text);
        let reply = tokio::time::timeout(self.timeout, self.model.generate(&prompt))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))??;
        tracing::debug!(reply_chars = reply.len(), "Model replied");
        parse_reply(&reply)
    }
}
