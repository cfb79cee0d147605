//! Request filter - literal redaction rules applied to outgoing bodies
//!
//! Rules come from `filter.json` and run left-to-right over the serialized
//! request body; later rules see the output of earlier ones. Matching is
//! plain byte-literal substring search - no regex, no escaping - so the
//! engine never alters bytes outside matched spans.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    #[default]
    Replace,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub source: String,
    #[serde(default)]
    pub op: FilterOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    rules: Vec<FilterRule>,
}

impl FilterEngine {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    /// Build an engine from the raw `filter.json` document. The document is
    /// normally an array; a single rule object is also accepted.
    pub fn from_doc(doc: &Value) -> Self {
        let rules = match doc {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            Value::Object(_) => serde_json::from_value(doc.clone())
                .map(|rule| vec![rule])
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Self::new(rules)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule in declared order. Rules with an empty `source` are
    /// skipped.
    pub fn apply(&self, body: &[u8]) -> Vec<u8> {
        let mut content = body.to_vec();
        for rule in &self.rules {
            if rule.source.is_empty() {
                continue;
            }
            let replacement: &[u8] = match rule.op {
                FilterOp::Replace => rule.target.as_deref().unwrap_or("").as_bytes(),
                FilterOp::Remove => b"",
            };
            content = replace_bytes(&content, rule.source.as_bytes(), replacement);
        }
        content
    }
}

/// Replace every occurrence of `needle` in `haystack` with `replacement`,
/// scanning left to right without re-matching inside replacements.
fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replace_rewrites_every_occurrence() {
        let engine = FilterEngine::from_doc(&json!([
            {"source": "sk-live-XYZ", "op": "replace", "target": "sk-***"}
        ]));
        let body = br#"{"key":"sk-live-XYZ","again":"sk-live-XYZ"}"#;
        let out = engine.apply(body);
        assert_eq!(out, br#"{"key":"sk-***","again":"sk-***"}"#.to_vec());
    }

    #[test]
    fn remove_deletes_occurrences() {
        let engine = FilterEngine::from_doc(&json!([
            {"source": "secret-", "op": "remove"}
        ]));
        assert_eq!(engine.apply(b"secret-token"), b"token".to_vec());
    }

    #[test]
    fn rules_apply_in_declared_order() {
        // The second rule sees the output of the first
        let engine = FilterEngine::from_doc(&json!([
            {"source": "aaa", "op": "replace", "target": "bbb"},
            {"source": "bbb", "op": "replace", "target": "ccc"}
        ]));
        assert_eq!(engine.apply(b"aaa"), b"ccc".to_vec());
    }

    #[test]
    fn empty_source_is_skipped() {
        let engine = FilterEngine::from_doc(&json!([
            {"source": "", "op": "replace", "target": "x"}
        ]));
        assert_eq!(engine.apply(b"unchanged"), b"unchanged".to_vec());
    }

    #[test]
    fn idempotent_when_no_literal_matches() {
        let engine = FilterEngine::from_doc(&json!([
            {"source": "needle", "op": "replace", "target": "thread"}
        ]));
        let body = br#"{"model":"claude-opus-4","messages":[]}"#;
        assert_eq!(engine.apply(body), body.to_vec());
    }

    #[test]
    fn single_object_document_is_accepted() {
        let engine =
            FilterEngine::from_doc(&json!({"source": "a", "op": "replace", "target": "b"}));
        assert_eq!(engine.apply(b"a"), b"b".to_vec());
    }

    #[test]
    fn non_utf8_bytes_outside_matches_are_untouched() {
        let engine = FilterEngine::from_doc(&json!([
            {"source": "key", "op": "remove"}
        ]));
        let body = [0xFF, 0xFE, b'k', b'e', b'y', 0xFD];
        assert_eq!(engine.apply(&body), vec![0xFF, 0xFE, 0xFD]);
    }
}
