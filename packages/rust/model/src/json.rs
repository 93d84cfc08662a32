//! Structured-response extraction from model text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use skillfactory_shared::{Result, SkillFactoryError};

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*\n?(.*?)\s*```\s*$").expect("valid regex")
});

static EMBEDDED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)[\[{].*[\]}]").expect("valid regex"));

/// Remove a surrounding Markdown code fence, if any.
pub fn strip_fences(text: &str) -> &str {
    match FENCE_RE.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => text.trim(),
    }
}

/// Parse model output as JSON. Makes one bounded re-extraction attempt on
/// the outermost bracketed span before giving up.
pub fn extract_json(text: &str) -> Result<Value> {
    let body = strip_fences(text);
    if let Ok(value) = serde_json::from_str(body) {
        return Ok(value);
    }

    let embedded = EMBEDDED_RE
        .find(body)
        .ok_or_else(|| SkillFactoryError::parse("no JSON object in model response"))?;
    serde_json::from_str(embedded.as_str())
        .map_err(|e| SkillFactoryError::parse(format!("malformed JSON in model response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json() {
        let v = extract_json(r#"{"topics": [1, 2]}"#).unwrap();
        assert_eq!(v["topics"][1], 2);
    }

    #[test]
    fn fenced_json() {
        let v = extract_json("```json\n{\"ok\": true}\n```").unwrap();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn json_embedded_in_prose() {
        let v = extract_json("Here is the result:\n{\"atoms\": []}\nHope it helps.").unwrap();
        assert!(v["atoms"].as_array().unwrap().is_empty());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = extract_json("I could not do that.").unwrap_err();
        assert!(matches!(err, SkillFactoryError::Parse { .. }));
        assert!(extract_json("{ broken").is_err());
    }
}
