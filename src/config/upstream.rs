//! Upstream config entries - one named credential + base URL + policy entry
//!
//! Parsing is deliberately permissive: unknown fields are captured in an
//! extra map and written back untouched, so hand-edited config files
//! round-trip without loss.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Credential material resolved from a config entry.
///
/// Exactly one of the two variants is ever sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// `Authorization: Bearer <token>`
    AuthToken(String),
    /// `x-api-key: <key>` (any incoming Authorization header is dropped)
    ApiKey(String),
}

/// One upstream entry within a family config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub active: bool,

    #[serde(default)]
    pub weight: u32,

    /// Requests-per-minute cap; absent or 0 means unlimited.
    #[serde(
        default,
        alias = "requests_per_minute",
        skip_serializing_if = "Option::is_none"
    )]
    pub rpm_limit: Option<u32>,

    /// Tri-state streaming preference: None = follow the client,
    /// Some(true) = always stream to the client, Some(false) = never.
    #[serde(
        default,
        deserialize_with = "de_tristate",
        skip_serializing_if = "Option::is_none"
    )]
    pub streaming: Option<bool>,

    /// Tri-state override for streaming when the request carries tools.
    #[serde(
        default,
        deserialize_with = "de_tristate",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_calls_streaming: Option<bool>,

    /// Unknown fields, preserved on write.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl UpstreamConfig {
    /// Resolve the credential to send upstream. `auth_token` wins when both
    /// are present; empty strings count as absent.
    pub fn credential(&self) -> Option<Credential> {
        if let Some(token) = self.auth_token.as_deref().filter(|t| !t.is_empty()) {
            return Some(Credential::AuthToken(token.to_string()));
        }
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| Credential::ApiKey(k.to_string()))
    }

    /// The RPM limit actually enforced; 0 is treated as unlimited.
    pub fn effective_rpm(&self) -> Option<u32> {
        self.rpm_limit.filter(|&rpm| rpm > 0)
    }
}

/// Family config document: config name -> entry.
pub type UpstreamSet = BTreeMap<String, UpstreamConfig>;

/// Parse a family config document, skipping entries that are not objects
/// or lack a base_url. Matches the permissive loader in the config store.
pub fn parse_upstreams(doc: &Value) -> UpstreamSet {
    let mut set = UpstreamSet::new();
    let Some(map) = doc.as_object() else {
        return set;
    };
    for (name, entry) in map {
        match serde_json::from_value::<UpstreamConfig>(entry.clone()) {
            Ok(config) => {
                set.insert(name.clone(), config);
            }
            Err(err) => {
                tracing::warn!("Skipping malformed upstream config '{}': {}", name, err);
            }
        }
    }
    set
}

/// Accept `true`/`false`, their common string spellings, or "auto" (= unset).
fn de_tristate<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credential_prefers_auth_token() {
        let config: UpstreamConfig = serde_json::from_value(json!({
            "base_url": "https://api.example.com",
            "auth_token": "tok",
            "api_key": "key"
        }))
        .unwrap();
        assert_eq!(config.credential(), Some(Credential::AuthToken("tok".into())));
    }

    #[test]
    fn empty_auth_token_falls_back_to_api_key() {
        let config: UpstreamConfig = serde_json::from_value(json!({
            "base_url": "https://api.example.com",
            "auth_token": "",
            "api_key": "key"
        }))
        .unwrap();
        assert_eq!(config.credential(), Some(Credential::ApiKey("key".into())));
    }

    #[test]
    fn zero_rpm_means_unlimited() {
        let config: UpstreamConfig = serde_json::from_value(json!({
            "base_url": "https://api.example.com",
            "auth_token": "t",
            "rpm_limit": 0
        }))
        .unwrap();
        assert_eq!(config.effective_rpm(), None);
    }

    #[test]
    fn rpm_alias_is_accepted() {
        let config: UpstreamConfig = serde_json::from_value(json!({
            "base_url": "https://api.example.com",
            "auth_token": "t",
            "requests_per_minute": 30
        }))
        .unwrap();
        assert_eq!(config.effective_rpm(), Some(30));
    }

    #[test]
    fn streaming_accepts_string_spellings() {
        let config: UpstreamConfig = serde_json::from_value(json!({
            "base_url": "https://api.example.com",
            "auth_token": "t",
            "streaming": "on",
            "tool_calls_streaming": "auto"
        }))
        .unwrap();
        assert_eq!(config.streaming, Some(true));
        assert_eq!(config.tool_calls_streaming, None);
    }

    #[test]
    fn unknown_fields_round_trip() {
        let original = json!({
            "base_url": "https://api.example.com",
            "auth_token": "tok",
            "active": true,
            "weight": 5,
            "custom_note": "keep me",
            "nested": {"a": 1}
        });
        let config: UpstreamConfig = serde_json::from_value(original.clone()).unwrap();
        assert_eq!(config.extra.get("custom_note"), Some(&json!("keep me")));

        let back = serde_json::to_value(&config).unwrap();
        let reparsed: UpstreamConfig = serde_json::from_value(back).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn parse_upstreams_skips_malformed_entries() {
        let doc = json!({
            "good": {"base_url": "https://a", "auth_token": "t"},
            "bad": "not an object"
        });
        let set = parse_upstreams(&doc);
        assert_eq!(set.len(), 1);
        assert!(set.contains_key("good"));
    }
}
