//! Anthropic messages API backend
//!
//! The messages API returns a single completion per request, so sampling
//! issues one request per sample. A failed request ends the loop but keeps
//! the samples already received; the call fails only when none arrived.
//! The processor requests the remaining slots on the next run.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::image::{encode_image, EncodedImage};
use super::{
    read_json, Annotator, AnnotatorError, AnnotatorResult, BackendSettings, RawOutput, RawResult,
};
use crate::retry::retry_with_backoff;
use crate::types::AnnotatorIdentity;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeAnnotator {
    settings: BackendSettings,
    client: reqwest::Client,
}

impl ClaudeAnnotator {
    pub fn new(settings: BackendSettings) -> AnnotatorResult<Self> {
        let client = settings.http_client()?;
        Ok(Self { settings, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.settings.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, image: &EncodedImage) -> Value {
        let mut body = json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "system": self.settings.prompt.system,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.media_type,
                            "data": image.data
                        }
                    },
                    {"type": "text", "text": self.settings.prompt.user}
                ]
            }]
        });
        if let Some(temperature) = self.settings.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

/// Concatenate the text blocks of a messages response.
pub(crate) fn parse_message(response: &Value) -> AnnotatorResult<String> {
    let blocks = response["content"]
        .as_array()
        .ok_or_else(|| AnnotatorError::ParseError("response has no content".to_string()))?;
    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();
    Ok(text)
}

#[async_trait]
impl Annotator for ClaudeAnnotator {
    fn identity(&self) -> AnnotatorIdentity {
        self.settings.identity.clone()
    }

    async fn annotate(&self, image_path: &Path, num_samples: usize) -> AnnotatorResult<RawResult> {
        let image = encode_image(image_path, self.settings.max_image_bytes).await?;
        let body = self.request_body(&image);
        let url = self.endpoint();
        let (client, api_key, url, body) = (&self.client, &self.settings.api_key, &url, &body);

        let mut raw = RawResult::default();
        for sample in 0..num_samples.max(1) {
            debug!(
                annotator = %self.settings.identity,
                image = %image_path.display(),
                sample,
                "Claude request"
            );
            let sampled = retry_with_backoff(&self.settings.retry, "claude", || async move {
                let response = client
                    .post(url)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(body)
                    .send()
                    .await?;
                read_json(response).await
            })
            .await
            .and_then(|response| parse_message(&response).map(|text| (text, response)));

            match sampled {
                Ok((text, response)) => {
                    raw.outputs.push(RawOutput::Text(text));
                    if let Some(usage) = response.get("usage") {
                        raw.metadata.insert("usage".to_string(), usage.clone());
                    }
                }
                Err(e) if raw.outputs.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        annotator = %self.settings.identity,
                        image = %image_path.display(),
                        sample,
                        received = raw.outputs.len(),
                        error = %e,
                        "Claude sample request failed, keeping received samples"
                    );
                    break;
                }
            }
        }
        Ok(raw)
    }
}
