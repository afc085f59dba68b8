//! Google Gemini `generateContent` backend

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

pub struct GeminiAnnotator {
    settings: BackendSettings,
    client: reqwest::Client,
}

impl GeminiAnnotator {
    pub fn new(settings: BackendSettings) -> AnnotatorResult<Self> {
        let client = settings.http_client()?;
        Ok(Self { settings, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.model
        )
    }

    fn request_body(&self, image: &EncodedImage, num_samples: usize) -> Value {
        let mut generation = json!({
            "maxOutputTokens": self.settings.max_tokens,
            "candidateCount": num_samples.max(1),
        });
        if let Some(temperature) = self.settings.temperature {
            generation["temperature"] = json!(temperature);
        }
        json!({
            "systemInstruction": {"parts": [{"text": self.settings.prompt.system}]},
            "contents": [{
                "parts": [
                    {"inline_data": {"mime_type": image.media_type, "data": image.data}},
                    {"text": self.settings.prompt.user}
                ]
            }],
            "generationConfig": generation
        })
    }
}

/// One text output per candidate.
pub(crate) fn parse_candidates(response: &Value) -> AnnotatorResult<RawResult> {
    let candidates = response["candidates"]
        .as_array()
        .ok_or_else(|| AnnotatorError::ParseError("response has no candidates".to_string()))?;

    let outputs = candidates
        .iter()
        .map(|c| {
            let text: String = c["content"]["parts"]
                .as_array()
                .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
                .unwrap_or_default();
            RawOutput::Text(text)
        })
        .collect();

    let mut raw = RawResult {
        outputs,
        ..RawResult::default()
    };
    if let Some(usage) = response.get("usageMetadata") {
        raw.metadata.insert("usage".to_string(), usage.clone());
    }
    Ok(raw)
}

#[async_trait]
impl Annotator for GeminiAnnotator {
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
            "Gemini request"
        );

        let (client, api_key, url, body) = (&self.client, &self.settings.api_key, &url, &body);
        let response = retry_with_backoff(&self.settings.retry, "gemini", || async move {
            let response = client
                .post(url)
                .query(&[("key", api_key)])
                .json(body)
                .send()
                .await?;
            read_json(response).await
        })
        .await?;

        parse_candidates(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotator::test_settings;

    #[test]
    fn test_request_body_shape() {
        let mut settings = test_settings("https://generativelanguage.googleapis.com");
        settings.temperature = Some(0.4);
        let ann = GeminiAnnotator::new(settings).unwrap();
        let image = EncodedImage {
            media_type: "image/png",
            data: "AAAA".into(),
        };
        let body = ann.request_body(&image, 3);

        assert_eq!(
            ann.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/model-x:generateContent"
        );
        assert_eq!(body["generationConfig"]["candidateCount"], 3);
        assert_eq!(body["generationConfig"]["temperature"], 0.4);
        assert_eq!(body["contents"][0]["parts"][0]["inline_data"]["mime_type"], "image/png");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
    }

    #[test]
    fn test_parse_candidates() {
        let response = json!({
            "candidates": [
                {"content": {"parts": [{"text": "{\"fields\":"}, {"text": "[]}"}]}},
                {"content": {"parts": []}}
            ]
        });
        let raw = parse_candidates(&response).unwrap();
        assert_eq!(raw.outputs[0], RawOutput::Text("{\"fields\":[]}".into()));
        assert_eq!(raw.outputs[1], RawOutput::Text(String::new()));
    }
}
