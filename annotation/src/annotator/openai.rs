//! OpenAI-compatible chat completions backend
//!
//! Works against api.openai.com and any server exposing the same
//! `/chat/completions` surface. Sampling uses the `n` request parameter so
//! one call yields every requested completion.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::image::{encode_image, EncodedImage};
use super::{
    read_json, Annotator, AnnotatorError, AnnotatorResult, BackendSettings, RawOutput, RawResult,
};
use crate::retry::retry_with_backoff;
use crate::types::AnnotatorIdentity;

pub struct OpenAiAnnotator {
    settings: BackendSettings,
    client: reqwest::Client,
}

impl OpenAiAnnotator {
    pub fn new(settings: BackendSettings) -> AnnotatorResult<Self> {
        let client = settings.http_client()?;
        Ok(Self { settings, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, image: &EncodedImage, num_samples: usize) -> Value {
        let mut body = json!({
            "model": self.settings.model,
            "messages": [
                {"role": "system", "content": self.settings.prompt.system},
                {
                    "role": "user",
                    "content": [
                        {"type": "image_url", "image_url": {"url": image.data_uri()}},
                        {"type": "text", "text": self.settings.prompt.user}
                    ]
                }
            ],
            "max_tokens": self.settings.max_tokens,
            "n": num_samples.max(1),
        });
        if let Some(temperature) = self.settings.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

/// Pull one text output per choice out of a chat completions response.
pub(crate) fn parse_choices(response: &Value) -> AnnotatorResult<RawResult> {
    let choices = response["choices"]
        .as_array()
        .ok_or_else(|| AnnotatorError::ParseError("response has no choices".to_string()))?;

    let outputs = choices
        .iter()
        .filter_map(|c| c["message"]["content"].as_str())
        .map(|text| RawOutput::Text(text.to_string()))
        .collect();

    let mut raw = RawResult {
        outputs,
        ..RawResult::default()
    };
    if let Some(created) = response.get("created") {
        raw.metadata.insert("created".to_string(), created.clone());
    }
    if let Some(usage) = response.get("usage") {
        raw.metadata.insert("usage".to_string(), usage.clone());
    }
    Ok(raw)
}

#[async_trait]
impl Annotator for OpenAiAnnotator {
    fn identity(&self) -> AnnotatorIdentity {
        self.settings.identity.clone()
    }

    async fn annotate(&self, image_path: &Path, num_samples: usize) -> AnnotatorResult<RawResult> {
        let image = encode_image(image_path, self.settings.max_image_bytes).await?;
        let body = self.request_body(&image, num_samples);
        let url = self.endpoint();

        debug!(
            annotator = %self.settings.identity,
            image = %image_path.display(),
            num_samples,
            "OpenAI request"
        );

        let (client, api_key, url, body) = (&self.client, &self.settings.api_key, &url, &body);
        let response = retry_with_backoff(&self.settings.retry, "openai", || async move {
            let response = client
                .post(url)
                .bearer_auth(api_key)
                .json(body)
                .send()
                .await?;
            read_json(response).await
        })
        .await?;

        parse_choices(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotator::test_settings;

    fn annotator(temperature: Option<f64>) -> OpenAiAnnotator {
        let mut settings = test_settings("http://localhost:9/v1/");
        settings.temperature = temperature;
        OpenAiAnnotator::new(settings).unwrap()
    }

    #[test]
    fn test_request_body_shape() {
        let ann = annotator(Some(0.7));
        let image = EncodedImage {
            media_type: "image/png",
            data: "AAAA".into(),
        };
        let body = ann.request_body(&image, 4);

        assert_eq!(ann.endpoint(), "http://localhost:9/v1/chat/completions");
        assert_eq!(body["model"], "model-x");
        assert_eq!(body["n"], 4);
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(
            body["messages"][1]["content"][0]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
        assert_eq!(body["messages"][1]["content"][1]["text"], "usr");
    }

    #[test]
    fn test_request_body_omits_unset_temperature() {
        let ann = annotator(None);
        let image = EncodedImage {
            media_type: "image/jpeg",
            data: String::new(),
        };
        let body = ann.request_body(&image, 0);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["n"], 1);
    }

    #[test]
    fn test_parse_choices() {
        let response = json!({
            "created": 1700000000,
            "choices": [
                {"message": {"content": "{\"fields\": []}"}},
                {"message": {"content": "second"}}
            ],
            "usage": {"total_tokens": 42}
        });
        let raw = parse_choices(&response).unwrap();
        assert_eq!(raw.outputs.len(), 2);
        assert_eq!(raw.outputs[1], RawOutput::Text("second".into()));
        assert_eq!(raw.metadata["usage"]["total_tokens"], 42);
    }

    #[test]
    fn test_parse_choices_rejects_error_body() {
        let response = json!({"error": {"message": "bad"}});
        assert!(matches!(
            parse_choices(&response),
            Err(AnnotatorError::ParseError(_))
        ));
    }
}
