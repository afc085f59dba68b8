//! Raw model output parsing and validation
//!
//! Models answer in free text that usually, but not always, wraps a JSON
//! object in a fenced code block. Extraction tries, in order:
//!
//! 1. the first fenced code block (```` ```json ```` or bare ```` ``` ````)
//! 2. the whole text
//! 3. the first balanced `{ ... }` object embedded in the text
//!
//! The extracted object must carry a field list, either as `{"fields": [...]}`
//! or as a full persisted record `{"result": {"fields": [...]}}`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::annotator::RawOutput;
use crate::types::Field;

static FENCED_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n(.*?)```")
        .expect("FENCED_BLOCK_RE regex should compile")
});

/// Errors from parsing model output
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("No JSON object found in output: {0}")]
    NoJson(String),

    #[error("Output has no field list")]
    MissingFields,

    #[error("Field list is empty")]
    EmptyFields,

    #[error("Field {index} is malformed: {reason}")]
    InvalidField { index: usize, reason: String },
}

/// Result type for parse operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Extract the first well-formed JSON object from free text.
pub fn extract_json_from_text(text: &str) -> ParseResult<Value> {
    for captures in FENCED_BLOCK_RE.captures_iter(text) {
        if let Some(Ok(value)) = captures
            .get(1)
            .map(|m| serde_json::from_str::<Value>(m.as_str().trim()))
        {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() {
            return Ok(value);
        }
    }

    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let candidate = &rest[start..];
        if let Some(end) = balanced_object_end(candidate) {
            if let Ok(value) = serde_json::from_str::<Value>(&candidate[..end]) {
                return Ok(value);
            }
        }
        rest = &candidate[1..];
    }

    Err(ParseError::NoJson(snippet(text)))
}

/// Byte length of the balanced object starting at `s[0] == '{'`.
fn balanced_object_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn snippet(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Read the field list out of a parsed JSON object.
pub fn parse_fields(value: &Value) -> ParseResult<Vec<Field>> {
    let list = value
        .get("fields")
        .or_else(|| value.get("result").and_then(|r| r.get("fields")))
        .and_then(Value::as_array)
        .ok_or(ParseError::MissingFields)?;

    list.iter()
        .enumerate()
        .map(|(index, item)| parse_field(index, item))
        .collect()
}

fn parse_field(index: usize, item: &Value) -> ParseResult<Field> {
    let invalid = |reason: &str| ParseError::InvalidField {
        index,
        reason: reason.to_string(),
    };

    let obj = item.as_object().ok_or_else(|| invalid("not an object"))?;
    let field_name = obj
        .get("field_name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid("missing field_name"))?;

    let value = match obj.get("value") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => 1.0,
        Some(c) => c
            .as_f64()
            .or_else(|| c.as_str().and_then(|s| s.trim().parse().ok()))
            .filter(|c| c.is_finite())
            .ok_or_else(|| invalid("confidence is not a number"))?
            .clamp(0.0, 1.0),
    };

    Ok(Field::new(field_name, value, confidence))
}

/// Parse one raw output into a validated, non-empty field list.
pub fn parse_output(output: &RawOutput) -> ParseResult<Vec<Field>> {
    let fields = match output {
        RawOutput::Text(text) => parse_fields(&extract_json_from_text(text)?)?,
        RawOutput::Structured(value) => parse_fields(value)?,
    };
    validate_fields(&fields)?;
    Ok(fields)
}

/// A field list is valid when it has at least one entry.
pub fn validate_fields(fields: &[Field]) -> ParseResult<()> {
    if fields.is_empty() {
        return Err(ParseError::EmptyFields);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here you go:\n```json\n{\"fields\": [{\"field_name\": \"a\", \"value\": \"1\"}]}\n```\nThanks";
        let value = extract_json_from_text(text).unwrap();
        assert_eq!(value["fields"][0]["value"], "1");
    }

    #[test]
    fn test_extract_bare_fence_and_whole_text() {
        let fenced = "```\n{\"x\": 1}\n```";
        assert_eq!(extract_json_from_text(fenced).unwrap()["x"], 1);

        let bare = "  {\"x\": 2}  ";
        assert_eq!(extract_json_from_text(bare).unwrap()["x"], 2);
    }

    #[test]
    fn test_extract_embedded_object() {
        let text = r#"The answer is {"fields": [{"field_name": "note", "value": "a } brace"}]} as requested."#;
        let value = extract_json_from_text(text).unwrap();
        assert_eq!(value["fields"][0]["value"], "a } brace");
    }

    #[test]
    fn test_extract_skips_malformed_fence() {
        let text = "```json\n{not json}\n```\nfallback {\"ok\": true}";
        assert_eq!(extract_json_from_text(text).unwrap()["ok"], true);
    }

    #[test]
    fn test_extract_no_json() {
        assert!(matches!(
            extract_json_from_text("I cannot read this image."),
            Err(ParseError::NoJson(_))
        ));
    }

    #[test]
    fn test_parse_fields_defaults_and_stringifies() {
        let value = json!({
            "fields": [
                {"field_name": "total", "value": 12.5},
                {"field_name": "paid", "value": true, "confidence": 0.4},
                {"field_name": "memo", "value": null, "confidence": "0.7"}
            ]
        });
        let fields = parse_fields(&value).unwrap();
        assert_eq!(fields[0], Field::new("total", "12.5", 1.0));
        assert_eq!(fields[1], Field::new("paid", "true", 0.4));
        assert_eq!(fields[2], Field::new("memo", "", 0.7));
    }

    #[test]
    fn test_parse_fields_accepts_persisted_shape() {
        let value = json!({"result": {"fields": [{"field_name": "a", "value": "b", "confidence": 1.7}]}});
        let fields = parse_fields(&value).unwrap();
        assert_eq!(fields[0].confidence, 1.0);
    }

    #[test]
    fn test_parse_fields_rejects_bad_entries() {
        assert!(matches!(
            parse_fields(&json!({"data": []})),
            Err(ParseError::MissingFields)
        ));
        assert!(matches!(
            parse_fields(&json!({"fields": [{"value": "x"}]})),
            Err(ParseError::InvalidField { index: 0, .. })
        ));
    }

    #[test]
    fn test_parse_output_rejects_empty_list() {
        let output = RawOutput::Text("```json\n{\"fields\": []}\n```".into());
        assert!(matches!(parse_output(&output), Err(ParseError::EmptyFields)));

        let structured = RawOutput::Structured(json!({"fields": [{"field_name": "a", "value": "b"}]}));
        assert_eq!(parse_output(&structured).unwrap().len(), 1);
    }
}
