//! Validated construction of atoms from model output.

use serde::Deserialize;
use serde_json::Value;
use skillfactory_shared::Atom;
use tracing::debug;

/// An atom as a model returns it. Every field is optional; unknown fields
/// are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelAtom {
    pub id: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub confidence: Option<f64>,
    pub source_timestamp: Option<String>,
    pub merged_from: Vec<String>,
}

impl ModelAtom {
    /// Build an atom, or `None` when there is no content.
    ///
    /// Confidence is clamped to [0, 1] and defaults to `default_confidence`.
    /// A missing title becomes "Untitled".
    pub fn into_atom(self, id: impl Into<String>, default_confidence: f64) -> Option<Atom> {
        let content = self.content.map(|c| c.trim().to_string()).unwrap_or_default();
        if content.is_empty() {
            return None;
        }
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string());

        let mut atom = Atom::new(id, title, content, self.category.unwrap_or_default().trim());
        atom.tags = self
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        atom.confidence = self
            .confidence
            .filter(|c| c.is_finite())
            .unwrap_or(default_confidence)
            .clamp(0.0, 1.0);
        atom.source_timestamp = self.source_timestamp.filter(|s| !s.trim().is_empty());
        atom.merged_from = self.merged_from;
        Some(atom)
    }
}

/// The array under `key`, or the value itself when the model returned a
/// bare array.
pub fn items<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    match value {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    }
}

/// Parse every element that has the right shape, skipping the rest.
pub fn parse_items<T: for<'de> Deserialize<'de>>(value: &Value, key: &str) -> Vec<T> {
    items(value, key)
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(error = %e, "skipping malformed item");
                None
            }
        })
        .collect()
}

/// Sequential atom id: `atom_0001`.
pub fn atom_id(n: usize) -> String {
    format!("atom_{n:04}")
}
