//! Prompt templates with `{{variable}}` substitution
//!
//! Template files are YAML:
//!
//! ```yaml
//! variables:
//!   document_type: invoice
//! default:
//!   vision_extraction:
//!     system: "You extract fields from {{document_type}} images."
//!     user: "Return JSON."
//! openai:
//!   vision_extraction:
//!     system: ...
//!     user: ...
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::{AnnotatorError, AnnotatorResult};

const BUILTIN_TEMPLATES: &str = r#"
variables:
  document_type: document
default:
  vision_extraction:
    system: |
      You are a meticulous document annotator. Read the {{document_type}} image and
      extract every labelled field you can see. Respond with a single JSON object of
      the form {"fields": [{"field_name": "...", "value": "...", "confidence": 0.0}]}
      where confidence is your certainty between 0 and 1. Do not add commentary.
    user: |
      Extract all fields from this {{document_type}} and return only the JSON object.
"#;

/// A rendered system/user prompt pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Collection of prompt templates keyed by provider and task.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptTemplates {
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(flatten)]
    sections: HashMap<String, HashMap<String, Prompt>>,
}

impl PromptTemplates {
    pub fn from_yaml_str(yaml: &str) -> AnnotatorResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| AnnotatorError::Prompt(e.to_string()))
    }

    pub fn from_file(path: &Path) -> AnnotatorResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AnnotatorError::Prompt(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
    }

    /// Templates shipped with the crate
    pub fn builtin() -> Self {
        match Self::from_yaml_str(BUILTIN_TEMPLATES) {
            Ok(templates) => templates,
            Err(_) => Self {
                variables: HashMap::new(),
                sections: HashMap::new(),
            },
        }
    }

    /// Render the template for `provider`/`task`, falling back to `default`.
    /// Call-site variables override the file's defaults.
    pub fn render(
        &self,
        provider: &str,
        task: &str,
        variables: Option<&HashMap<String, String>>,
    ) -> AnnotatorResult<Prompt> {
        let template = self
            .sections
            .get(provider)
            .and_then(|s| s.get(task))
            .or_else(|| self.sections.get("default").and_then(|s| s.get(task)))
            .ok_or_else(|| {
                AnnotatorError::Prompt(format!(
                    "No template found for model={provider}, task={task}"
                ))
            })?;

        let mut merged = self.variables.clone();
        if let Some(vars) = variables {
            merged.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Ok(Prompt {
            system: substitute(&template.system, &merged),
            user: substitute(&template.user, &merged),
        })
    }
}

fn substitute(template: &str, variables: &HashMap<String, String>) -> String {
    variables
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{{{key}}}}}"), value)
        })
}
