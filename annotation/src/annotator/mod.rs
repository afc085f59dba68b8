//! Annotator backends
//!
//! An annotator is a vision-capable model that, given an image path, returns
//! one or more raw text blobs (or already-structured JSON). The core treats it
//! as a black box: every failure surfaces as an [`AnnotatorError`] and is
//! converted into "no result for this attempt" by the processor.
//!
//! # Backends
//!
//! - [`OpenAiAnnotator`]: OpenAI-compatible chat completions (`n` sampling)
//! - [`ClaudeAnnotator`]: Anthropic messages API
//! - [`GeminiAnnotator`]: Google `generateContent` (`candidateCount` sampling)
//!
//! Backends are constructed through an [`AnnotatorFactory`] so that every
//! execution unit owns its own client.

pub mod claude;
pub mod gemini;
pub mod image;
pub mod openai;
pub mod prompt;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{AnnotatorConfig, AnnotatorKind};
use crate::retry::RetryPolicy;
use crate::types::AnnotatorIdentity;

pub use claude::ClaudeAnnotator;
pub use gemini::GeminiAnnotator;
pub use image::{encode_image, EncodedImage, DEFAULT_MAX_IMAGE_BYTES};
pub use openai::OpenAiAnnotator;
pub use prompt::{Prompt, PromptTemplates};

/// HTTP status codes worth another attempt
pub const RETRYABLE_STATUS_CODES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Errors from annotator backends
#[derive(Debug, thiserror::Error)]
pub enum AnnotatorError {
    #[error("API request failed: {0}")]
    RequestFailed(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("API key not configured for {0}")]
    MissingApiKey(String),

    #[error("Response parse error: {0}")]
    ParseError(String),

    #[error("Image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("Image {path} exceeds size limit ({size} > {limit} bytes)")]
    ImageTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Prompt error: {0}")]
    Prompt(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AnnotatorError {
    /// Transport failures and throttling/server statuses are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(_) => true,
            Self::Api { status, .. } => RETRYABLE_STATUS_CODES.contains(status),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AnnotatorError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Api {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => Self::RequestFailed(e.to_string()),
        }
    }
}

/// Result type for annotator operations
pub type AnnotatorResult<T> = Result<T, AnnotatorError>;

/// One model completion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    /// Free text, possibly wrapping JSON in a fenced code block
    Text(String),
    /// Already-structured JSON
    Structured(Value),
}

/// What a single `annotate` call produced: one output per requested sample
/// plus metadata shared by all of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub outputs: Vec<RawOutput>,
    pub metadata: BTreeMap<String, Value>,
}

impl RawResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            outputs: vec![RawOutput::Text(text.into())],
            metadata: BTreeMap::new(),
        }
    }

    pub fn structured(value: Value) -> Self {
        Self {
            outputs: vec![RawOutput::Structured(value)],
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Capability contract every model backend satisfies.
///
/// Implementations must be safe to call repeatedly and concurrently; no warm
/// state is required between calls.
#[async_trait]
pub trait Annotator: Send + Sync {
    /// Identity used for cache paths and voter ids
    fn identity(&self) -> AnnotatorIdentity;

    /// Annotate one image, requesting `num_samples` independent completions.
    async fn annotate(&self, image_path: &Path, num_samples: usize) -> AnnotatorResult<RawResult>;
}

/// Settings shared by the HTTP backends, resolved from an [`AnnotatorConfig`].
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub identity: AnnotatorIdentity,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub prompt: Prompt,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub max_image_bytes: u64,
}

impl BackendSettings {
    pub fn http_client(&self) -> AnnotatorResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| AnnotatorError::Configuration(format!("HTTP client: {e}")))
    }
}

/// Builds a fresh annotator for one configuration.
pub trait AnnotatorFactory: Send + Sync {
    fn create(&self, config: &AnnotatorConfig) -> AnnotatorResult<Arc<dyn Annotator>>;
}

/// Default factory producing the HTTP backends.
#[derive(Debug, Clone)]
pub struct HttpAnnotatorFactory {
    /// Task-level prompt template file, overridden per annotator
    pub prompt_path: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub max_image_bytes: u64,
}

impl Default for HttpAnnotatorFactory {
    fn default() -> Self {
        Self {
            prompt_path: None,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(120),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl HttpAnnotatorFactory {
    pub fn with_prompt_path(mut self, path: Option<PathBuf>) -> Self {
        self.prompt_path = path;
        self
    }

    fn settings(&self, config: &AnnotatorConfig) -> AnnotatorResult<BackendSettings> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| AnnotatorError::MissingApiKey(config.name.clone()))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| AnnotatorError::Configuration(format!("{}: no model", config.name)))?;

        let templates = match config.prompt_path.as_ref().or(self.prompt_path.as_ref()) {
            Some(path) => PromptTemplates::from_file(path)?,
            None => PromptTemplates::builtin(),
        };
        let prompt = templates.render(config.kind.prompt_key(), &config.task, None)?;

        Ok(BackendSettings {
            identity: config.identity(),
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| default_base_url(config.kind).to_string()),
            model,
            max_tokens: config.max_tokens.unwrap_or(1000),
            temperature: config.temperature,
            prompt,
            retry: self.retry.clone(),
            timeout: self.timeout,
            max_image_bytes: self.max_image_bytes,
        })
    }
}

impl AnnotatorFactory for HttpAnnotatorFactory {
    fn create(&self, config: &AnnotatorConfig) -> AnnotatorResult<Arc<dyn Annotator>> {
        let settings = self.settings(config)?;
        if config.base_url.is_some() {
            tracing::warn!(
                annotator = %settings.identity,
                base_url = %settings.base_url,
                "Using custom API endpoint"
            );
        }
        let annotator: Arc<dyn Annotator> = match config.kind {
            AnnotatorKind::Openai => Arc::new(OpenAiAnnotator::new(settings)?),
            AnnotatorKind::Claude => Arc::new(ClaudeAnnotator::new(settings)?),
            AnnotatorKind::Gemini => Arc::new(GeminiAnnotator::new(settings)?),
        };
        Ok(annotator)
    }
}

fn default_base_url(kind: AnnotatorKind) -> &'static str {
    match kind {
        AnnotatorKind::Openai => "https://api.openai.com/v1",
        AnnotatorKind::Claude => "https://api.anthropic.com",
        AnnotatorKind::Gemini => "https://generativelanguage.googleapis.com",
    }
}

/// Turn a non-success HTTP response into an [`AnnotatorError::Api`].
pub(crate) async fn read_json(response: reqwest::Response) -> AnnotatorResult<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AnnotatorError::Api {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|e| AnnotatorError::ParseError(e.to_string()))
}

#[cfg(test)]
pub(crate) fn test_settings(base_url: &str) -> BackendSettings {
    BackendSettings {
        identity: AnnotatorIdentity::new("test", "model-x"),
        api_key: "sk-test".into(),
        base_url: base_url.into(),
        model: "model-x".into(),
        max_tokens: 500,
        temperature: None,
        prompt: Prompt {
            system: "sys".into(),
            user: "usr".into(),
        },
        retry: RetryPolicy::none(),
        timeout: Duration::from_secs(5),
        max_image_bytes: 1024,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AnnotatorError::RequestFailed("timeout".into()).is_retryable());
        assert!(AnnotatorError::Api {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(AnnotatorError::Api {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!AnnotatorError::Api {
            status: 401,
            body: String::new()
        }
        .is_retryable());
        assert!(!AnnotatorError::ParseError("bad".into()).is_retryable());
        assert!(!AnnotatorError::MissingApiKey("x".into()).is_retryable());
    }

    #[test]
    fn test_factory_requires_api_key() {
        let mut config = AnnotatorConfig::new("local", AnnotatorKind::Openai, "gpt-4o");
        config.api_key = Some(String::new());
        // Only meaningful when the env fallback is absent in the test environment
        if std::env::var("OPENAI_API_KEY").is_err() {
            let err = HttpAnnotatorFactory::default().create(&config).err();
            assert!(matches!(err, Some(AnnotatorError::MissingApiKey(_))));
        }
    }

    #[test]
    fn test_factory_builds_each_kind() {
        let factory = HttpAnnotatorFactory::default();
        for kind in [
            AnnotatorKind::Openai,
            AnnotatorKind::Claude,
            AnnotatorKind::Gemini,
        ] {
            let mut config = AnnotatorConfig::new("ann", kind, "model-x");
            config.api_key = Some("key".into());
            let annotator = factory.create(&config).unwrap();
            assert_eq!(annotator.identity(), AnnotatorIdentity::new("ann", "model-x"));
        }
    }

    #[test]
    fn test_settings_defaults() {
        let mut config = AnnotatorConfig::new("claude", AnnotatorKind::Claude, "claude-3-opus");
        config.api_key = Some("key".into());
        let settings = HttpAnnotatorFactory::default().settings(&config).unwrap();
        assert_eq!(settings.base_url, "https://api.anthropic.com");
        assert_eq!(settings.max_tokens, 1000);
        assert!(!settings.prompt.system.is_empty());
    }
}
