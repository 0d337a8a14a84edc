//! JSON extraction for generative backend responses.
//!
//! Models often wrap the requested program in markdown fences or put
//! reasoning text before it. Extraction tries, in order:
//! 1. A fenced code block (```json ... ``` or ``` ... ```)
//! 2. The whole response, if it is a JSON object
//! 3. The last balanced JSON object anywhere in the response
//!
//! If none parses but an object was opened and never closed, the response is
//! reported as truncated so the caller can tell a cut-off answer from a
//! missing one.
//!
//! # Example
//!
//! ```
//! use sciforge::utils::json_extraction::try_extract_json_object;
//!
//! let response = "Here is the plan:\n```json\n{\"steps\": []}\n```";
//! let json = try_extract_json_object(response).into_result().unwrap();
//! assert_eq!(json, "{\"steps\": []}");
//! ```

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Error type for JSON extraction failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed_braces} unclosed braces, {unclosed_brackets} unclosed brackets. Partial: {partial_preview}...")]
    Truncated {
        partial_preview: String,
        unclosed_braces: usize,
        unclosed_brackets: usize,
    },
    #[error("No JSON object found in response. Content starts with: '{content_preview}'")]
    NotFound { content_preview: String },
}

/// Result of a JSON extraction attempt
#[derive(Debug, Clone, PartialEq)]
pub enum JsonExtractionResult {
    /// A complete object that parses as JSON
    Success(String),
    /// An object was opened but never closed
    Truncated {
        partial_json: String,
        unclosed_braces: usize,
        unclosed_brackets: usize,
    },
    NotFound,
}

impl JsonExtractionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JsonExtractionResult::Success(_))
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, JsonExtractionResult::Truncated { .. })
    }

    /// Converts the result to a Result with a descriptive error
    pub fn into_result(self) -> Result<String, JsonExtractionError> {
        self.into_result_with_context("")
    }

    /// Like [`into_result`](Self::into_result), quoting the start of `content`
    /// when nothing was found.
    pub fn into_result_with_context(self, content: &str) -> Result<String, JsonExtractionError> {
        match self {
            JsonExtractionResult::Success(json) => Ok(json),
            JsonExtractionResult::Truncated {
                partial_json,
                unclosed_braces,
                unclosed_brackets,
            } => Err(JsonExtractionError::Truncated {
                partial_preview: preview(&partial_json, 100),
                unclosed_braces,
                unclosed_brackets,
            }),
            JsonExtractionResult::NotFound => Err(JsonExtractionError::NotFound {
                content_preview: preview(content.trim(), 80),
            }),
        }
    }
}

/// First `max` characters of `s`, on a char boundary.
fn preview(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Brace/bracket balance of a string, ignoring anything inside string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JsonStructureAnalysis {
    pub unclosed_braces: usize,
    pub unclosed_brackets: usize,
    /// The string ended inside a string literal.
    pub in_string: bool,
    /// Byte offset of the first `{`.
    pub object_start: Option<usize>,
}

impl JsonStructureAnalysis {
    pub fn is_unbalanced(&self) -> bool {
        self.unclosed_braces > 0 || self.unclosed_brackets > 0 || self.in_string
    }
}

pub fn analyze_json_structure(s: &str) -> JsonStructureAnalysis {
    let mut braces: isize = 0;
    let mut brackets: isize = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut object_start = None;

    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                object_start.get_or_insert(i);
                braces += 1;
            }
            '}' if !in_string => braces -= 1,
            '[' if !in_string => brackets += 1,
            ']' if !in_string => brackets -= 1,
            _ => {}
        }
    }

    JsonStructureAnalysis {
        unclosed_braces: braces.max(0) as usize,
        unclosed_brackets: brackets.max(0) as usize,
        in_string,
        object_start,
    }
}

/// Byte index of the `}` closing the object that opens at `s[0]`.
///
/// Returns `None` when `s` does not start with `{` or the object never closes.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn code_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```").expect("valid code block regex")
    })
}

/// Contents of the first fenced code block that holds a JSON object.
pub fn extract_from_code_block(content: &str) -> Option<String> {
    code_block_regex()
        .captures_iter(content)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
        .find(|body| body.starts_with('{') && is_json_object(body))
}

/// The last balanced `{...}` in `content` that parses as a JSON object.
///
/// Reasoning text before the answer often contains stray braces, so the
/// search runs from the end.
pub fn extract_last_json_object(content: &str) -> Option<String> {
    let starts: Vec<usize> = content.match_indices('{').map(|(i, _)| i).collect();
    starts.into_iter().rev().find_map(|start| {
        let end = find_matching_brace(&content[start..])?;
        let candidate = &content[start..=start + end];
        is_json_object(candidate).then(|| candidate.to_string())
    })
}

fn is_json_object(s: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(s),
        Ok(serde_json::Value::Object(_))
    )
}

/// Extract a JSON object from a model response.
pub fn try_extract_json_object(content: &str) -> JsonExtractionResult {
    let trimmed = content.trim();

    if let Some(json) = extract_from_code_block(trimmed) {
        return JsonExtractionResult::Success(json);
    }

    if trimmed.starts_with('{') && is_json_object(trimmed) {
        return JsonExtractionResult::Success(trimmed.to_string());
    }

    if let Some(json) = extract_last_json_object(trimmed) {
        return JsonExtractionResult::Success(json);
    }

    let analysis = analyze_json_structure(trimmed);
    match analysis.object_start {
        Some(start) if analysis.is_unbalanced() => JsonExtractionResult::Truncated {
            partial_json: trimmed[start..].to_string(),
            unclosed_braces: analysis.unclosed_braces,
            unclosed_brackets: analysis.unclosed_brackets,
        },
        _ => JsonExtractionResult::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_object() {
        let result = try_extract_json_object(r#"  {"steps": [{"op": "describe"}]}  "#);
        assert_eq!(
            result,
            JsonExtractionResult::Success(r#"{"steps": [{"op": "describe"}]}"#.to_string())
        );
    }

    #[test]
    fn test_fenced_block_wins_over_prose() {
        let response = "I will use {braces} in prose.\n```json\n{\"steps\": []}\n```\nDone.";
        assert_eq!(
            try_extract_json_object(response).into_result().expect("found"),
            "{\"steps\": []}"
        );

        let generic = "```\n{\"a\": 1}\n```";
        assert!(try_extract_json_object(generic).is_success());
    }

    #[test]
    fn test_last_object_after_reasoning() {
        let response = "Thinking: maybe {x}? Final answer: {\"steps\": [], \"rationale\": \"noop\"}";
        let json = try_extract_json_object(response).into_result().expect("found");
        assert!(json.contains("rationale"));
    }

    #[test]
    fn test_braces_inside_strings() {
        let s = r#"{"a": "}{", "b": {"c": "\"}"}} trailing"#;
        let end = find_matching_brace(s).expect("balanced");
        assert_eq!(&s[end + 1..], " trailing");
    }

    #[test]
    fn test_truncated_and_missing() {
        let truncated = try_extract_json_object(r#"{"steps": [{"op": "describe""#);
        assert!(truncated.is_truncated());
        assert!(matches!(
            truncated.into_result(),
            Err(JsonExtractionError::Truncated { unclosed_braces: 2, unclosed_brackets: 1, .. })
        ));

        let missing = try_extract_json_object("no json here");
        assert_eq!(
            missing.into_result_with_context("no json here"),
            Err(JsonExtractionError::NotFound {
                content_preview: "no json here".to_string()
            })
        );
    }

    #[test]
    fn test_arrays_are_not_objects() {
        assert_eq!(try_extract_json_object("[1, 2, 3]"), JsonExtractionResult::NotFound);
    }
}
