use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tillslip_core::ModelConfig;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Model reply contained no text")]
    EmptyReply,
    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("No API key configured for model `{0}` (set GEMINI_API_KEY)")]
    MissingApiKey(String),
    #[error("Model unavailable: {0}")]
    Unavailable(String),
}

/// A generative text model: one prompt in, one textual reply out.
///
/// Implementations are built by the caller and handed to the pipeline, so
/// credentials and transport never leak into extraction logic.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;
}

#[async_trait]
impl<T: LanguageModel + ?Sized> LanguageModel for Box<T> {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        (**self).generate(prompt).await
    }
}

#[async_trait]
impl<T: LanguageModel + ?Sized> LanguageModel for Arc<T> {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        (**self).generate(prompt).await
    }
}

// ── Gemini (Generative Language REST API) ─────────────────────────────────────

pub struct GeminiModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl GeminiModel {
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ModelError::MissingApiKey(config.name.clone()))?;
        let timeout = config.timeout();
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.name.clone(),
            api_key,
            timeout,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        tracing::debug!(model = %self.model, prompt_chars = prompt.len(), "Calling model");
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(prompt))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status { status: status.as_u16(), body });
        }

        let json: Value = resp.json().await.map_err(|e| self.classify(e))?;
        reply_text(&json).ok_or(ModelError::EmptyReply)
    }
}

impl GeminiModel {
    fn classify(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout(self.timeout)
        } else {
            ModelError::Http(e)
        }
    }
}

fn request_body(prompt: &str) -> Value {
    json!({ "contents": [{ "parts": [{ "text": prompt }] }] })
}

/// Concatenated text parts of the first candidate.
fn reply_text(json: &Value) -> Option<String> {
    let parts = json["candidates"][0]["content"]["parts"].as_array()?;
    let text: String = parts.iter().filter_map(|p| p["text"].as_str()).collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// ── Mock model (always available, used for tests) ─────────────────────────────

/// Replies with a fixed text (or fails) and records every prompt it received.
pub struct MockModel {
    reply: Result<String, String>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockModel {
    pub fn replying(text: impl Into<String>) -> Self {
        Self::with_reply(Ok(text.into()))
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_reply(Err(reason.into()))
    }

    fn with_reply(reply: Result<String, String>) -> Self {
        Self { reply, delay: None, prompts: Mutex::new(Vec::new()), calls: AtomicUsize::new(0) }
    }

    /// Sleep before answering, to exercise timeouts.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.clone().map_err(ModelError::Unavailable)
    }
}
