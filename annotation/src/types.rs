//! Core annotation types
//!
//! These types are persisted as JSON in the result cache and represent one
//! annotator's answer for one image, as well as the consensus record produced
//! by voting.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Voter identifier string: `name/model` or `name/model/sample_{i}`.
pub type VoterId = String;

/// Stable composite key naming one configured backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnnotatorIdentity {
    /// Configured annotator name (first cache path component)
    pub name: String,
    /// Model/version string (second cache path component)
    pub model: String,
}

impl AnnotatorIdentity {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
        }
    }

    /// Voter id for single-result mode.
    pub fn voter_id(&self) -> VoterId {
        format!("{}/{}", self.name, self.model)
    }

    /// Voter id for one slot of a sampling group.
    pub fn sample_voter_id(&self, sample_index: usize) -> VoterId {
        format!("{}/{}/sample_{}", self.name, self.model, sample_index)
    }
}

impl std::fmt::Display for AnnotatorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.model)
    }
}

/// One extracted field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub field_name: String,
    pub value: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl Field {
    pub fn new(field_name: impl Into<String>, value: impl Into<String>, confidence: f64) -> Self {
        Self {
            field_name: field_name.into(),
            value: value.into(),
            confidence,
        }
    }
}

/// The `result` object of a persisted record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSet {
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// Metadata attached to an annotation when it is persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationMetadata {
    /// RFC 3339 wall-clock timestamp
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    /// Sample slot, sampling mode only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_id: Option<usize>,
    /// Sampling temperature, sampling mode only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Backend-provided metadata (usage, provider timestamps, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One annotator's answer for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationResult {
    pub result: FieldSet,
    #[serde(default)]
    pub metadata: AnnotationMetadata,
}

impl AnnotationResult {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            result: FieldSet { fields },
            metadata: AnnotationMetadata::default(),
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.result.fields
    }

    /// A result without fields is never a valid cache entry.
    pub fn is_empty(&self) -> bool {
        self.result.fields.is_empty()
    }
}

/// Metadata of a consensus record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VotedMetadata {
    pub annotators: Vec<VoterId>,
    pub task_id: String,
    pub image_path: String,
    pub timestamp: String,
}

/// The consensus record for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotedResult {
    pub result: FieldSet,
    pub metadata: VotedMetadata,
}

impl VotedResult {
    pub fn new(fields: Vec<Field>, annotators: Vec<VoterId>) -> Self {
        Self {
            result: FieldSet { fields },
            metadata: VotedMetadata {
                annotators,
                task_id: String::new(),
                image_path: String::new(),
                timestamp: now_rfc3339(),
            },
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>, image_path: impl Into<String>) -> Self {
        self.metadata.task_id = task_id.into();
        self.metadata.image_path = image_path.into();
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.result.fields
    }

    /// Same consensus, ignoring when it was produced.
    pub fn same_consensus(&self, other: &VotedResult) -> bool {
        self.result == other.result
            && self.metadata.annotators == other.metadata.annotators
            && self.metadata.task_id == other.metadata.task_id
            && self.metadata.image_path == other.metadata.image_path
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voter_ids() {
        let id = AnnotatorIdentity::new("openai", "gpt-4o");
        assert_eq!(id.voter_id(), "openai/gpt-4o");
        assert_eq!(id.sample_voter_id(2), "openai/gpt-4o/sample_2");
        assert_eq!(id.to_string(), "openai/gpt-4o");
    }

    #[test]
    fn test_field_confidence_defaults_to_one() {
        let field: Field = serde_json::from_str(r#"{"field_name":"a","value":"b"}"#).unwrap();
        assert_eq!(field.confidence, 1.0);
    }

    #[test]
    fn test_annotation_result_shape() {
        let mut result = AnnotationResult::new(vec![Field::new("total", "12.00", 0.9)]);
        result.metadata.timestamp = "2025-01-01T00:00:00+00:00".to_string();
        result.metadata.sample_id = Some(1);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["result"]["fields"][0]["field_name"], "total");
        assert_eq!(json["metadata"]["sample_id"], 1);
        assert!(json["metadata"].get("temperature").is_none());

        let back: AnnotationResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_metadata_keeps_unknown_keys() {
        let raw = r#"{"result":{"fields":[]},"metadata":{"timestamp":"t","usage":{"total_tokens":3}}}"#;
        let result: AnnotationResult = serde_json::from_str(raw).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.metadata.extra["usage"]["total_tokens"], 3);
    }

    #[test]
    fn test_same_consensus_ignores_timestamp() {
        let a = VotedResult::new(vec![Field::new("f", "v", 1.0)], vec!["a/m".into()])
            .with_task("t", "img.png");
        let mut b = a.clone();
        b.metadata.timestamp = "later".to_string();
        assert!(a.same_consensus(&b));

        b.result.fields[0].value = "other".to_string();
        assert!(!a.same_consensus(&b));
    }
}
