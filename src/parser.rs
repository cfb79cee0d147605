//! Usage parser - extracts token accounting from upstream responses
//!
//! Runs as a sink on the tee from the streaming forwarder. Each family has
//! its own usage grammar; all of them normalize into one metrics shape so
//! aggregation and display do not care where the numbers came from.
//!
//! Parser failures are non-fatal: a response we cannot understand yields
//! zeroed metrics and a warning, never an error on the request path.

use crate::family::Family;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Normalized token metrics. All counters are non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub input: u64,
    pub cached_create: u64,
    pub cached_read: u64,
    pub output: u64,
    pub reasoning: u64,
    pub total: u64,
}

impl UsageMetrics {
    /// In-place addition, used by the per-channel aggregates.
    pub fn merge(&mut self, other: &UsageMetrics) {
        self.input += other.input;
        self.cached_create += other.cached_create;
        self.cached_read += other.cached_read;
        self.output += other.output;
        self.reasoning += other.reasoning;
        self.total += other.total;
    }

    pub fn is_zero(&self) -> bool {
        *self == UsageMetrics::default()
    }
}

/// Usage block persisted on each request record: normalized metrics plus
/// the raw upstream object for debugging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub service: String,
    pub metrics: UsageMetrics,
    #[serde(default)]
    pub raw: Value,
}

/// Extract usage from a raw response body (SSE or plain JSON).
pub fn extract_usage(family: Family, response: &[u8]) -> UsageRecord {
    let text = String::from_utf8_lossy(response);
    let text = text.trim();

    let raw = if text.is_empty() {
        None
    } else if text.starts_with("event:") || text.starts_with("data:") || text.contains("\ndata:") {
        extract_from_sse(family, text)
    } else {
        serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|payload| usage_from_payload(family, &payload))
    };

    if raw.is_none() && !text.is_empty() {
        tracing::warn!("No usage block found in {} response", family);
    }

    UsageRecord {
        service: family.service_name().to_string(),
        metrics: normalize(family, raw.as_ref()),
        raw: raw.unwrap_or(Value::Null),
    }
}

/// Normalize an already-extracted raw usage object.
pub fn normalize_usage(family: Family, raw: Option<&Value>) -> UsageRecord {
    UsageRecord {
        service: family.service_name().to_string(),
        metrics: normalize(family, raw),
        raw: raw.cloned().unwrap_or(Value::Null),
    }
}

/// Walk every `data:` line of an SSE stream and merge the usage objects it
/// carries. Claude splits usage across events (`message_start` has the
/// input side, `message_delta` the output side), so later fields override
/// earlier ones instead of replacing the whole object.
fn extract_from_sse(family: Family, text: &str) -> Option<Value> {
    let mut merged: Option<Map<String, Value>> = None;
    for line in text.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        let Some(Value::Object(usage)) = usage_from_payload(family, &payload) else {
            continue;
        };
        let acc = merged.get_or_insert_with(Map::new);
        for (key, value) in usage {
            if !value.is_null() {
                acc.insert(key, value);
            }
        }
    }
    merged.map(Value::Object)
}

fn usage_from_payload(family: Family, payload: &Value) -> Option<Value> {
    if let Some(usage) = payload.get("usage").filter(|u| u.is_object()) {
        return Some(usage.clone());
    }
    let nested = match family {
        Family::Claude => payload.get("message"),
        _ => payload.get("response"),
    }?;
    nested
        .get("usage")
        .filter(|u| u.is_object())
        .cloned()
}

fn normalize(family: Family, raw: Option<&Value>) -> UsageMetrics {
    let Some(raw) = raw else {
        return UsageMetrics::default();
    };

    let mut metrics = UsageMetrics::default();
    match family {
        Family::Claude => {
            metrics.input = count(raw, "input_tokens");
            metrics.cached_create = count(raw, "cache_creation_input_tokens");
            metrics.cached_read = count(raw, "cache_read_input_tokens");
            metrics.output = count(raw, "output_tokens");
            metrics.reasoning = count(raw, "reasoning_tokens");
        }
        Family::Codex => {
            let cached = raw
                .get("input_tokens_details")
                .map(|d| count(d, "cached_tokens"))
                .unwrap_or(0);
            // Cached-read tokens are reported separately, not double-counted
            // inside `input`.
            metrics.input = count(raw, "input_tokens").saturating_sub(cached);
            metrics.cached_read = cached;
            metrics.cached_create = count(raw, "cache_creation_input_tokens");
            metrics.output = count(raw, "output_tokens");
            metrics.reasoning = raw
                .get("output_tokens_details")
                .map(|d| count(d, "reasoning_tokens"))
                .unwrap_or(0);
        }
        Family::Legacy => {
            metrics.input = count(raw, "prompt_tokens");
            metrics.output = count(raw, "completion_tokens");
            metrics.cached_read = raw
                .get("prompt_tokens_details")
                .map(|d| count(d, "cached_tokens"))
                .unwrap_or(0);
            metrics.reasoning = raw
                .get("completion_tokens_details")
                .map(|d| count(d, "reasoning_tokens"))
                .unwrap_or(0);
        }
    }

    metrics.total = match raw.get("total_tokens").and_then(to_u64) {
        Some(total) => total.max(metrics.input + metrics.output),
        None => metrics.input + metrics.output,
    };
    metrics
}

fn count(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(to_u64).unwrap_or(0)
}

fn to_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_sse_usage_merges_across_events() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":120,\"cache_read_input_tokens\":1000,\"cache_creation_input_tokens\":40}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":55}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let record = extract_usage(Family::Claude, body.as_bytes());
        assert_eq!(record.metrics.input, 120);
        assert_eq!(record.metrics.cached_read, 1000);
        assert_eq!(record.metrics.cached_create, 40);
        assert_eq!(record.metrics.output, 55);
        assert_eq!(record.metrics.total, 175);
    }

    #[test]
    fn codex_input_excludes_cached_read() {
        let body = concat!(
            "event: response.completed\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"usage\":{",
            "\"input_tokens\":5000,\"output_tokens\":200,\"total_tokens\":5200,",
            "\"input_tokens_details\":{\"cached_tokens\":4500},",
            "\"output_tokens_details\":{\"reasoning_tokens\":80}}}}\n\n",
        );
        let record = extract_usage(Family::Codex, body.as_bytes());
        assert_eq!(record.metrics.input, 500);
        assert_eq!(record.metrics.cached_read, 4500);
        assert_eq!(record.metrics.reasoning, 80);
        assert_eq!(record.metrics.output, 200);
        assert!(record.metrics.total >= record.metrics.input + record.metrics.output);
    }

    #[test]
    fn legacy_json_total_defaults_to_sum() {
        let body = br#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":7}}"#;
        let record = extract_usage(Family::Legacy, body);
        assert_eq!(record.metrics.input, 10);
        assert_eq!(record.metrics.output, 7);
        assert_eq!(record.metrics.total, 17);
    }

    #[test]
    fn legacy_sse_takes_last_chunk_usage() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n\n",
            "data: [DONE]\n\n",
        );
        let record = extract_usage(Family::Legacy, body.as_bytes());
        assert_eq!(record.metrics.total, 4);
    }

    #[test]
    fn garbage_yields_zero_metrics() {
        let record = extract_usage(Family::Claude, b"\xFF\xFEnot json at all");
        assert!(record.metrics.is_zero());
        assert_eq!(record.raw, Value::Null);
    }

    #[test]
    fn merge_accumulates() {
        let mut acc = UsageMetrics::default();
        let sample = UsageMetrics {
            input: 1,
            cached_create: 2,
            cached_read: 3,
            output: 4,
            reasoning: 5,
            total: 5,
        };
        acc.merge(&sample);
        acc.merge(&sample);
        assert_eq!(acc.input, 2);
        assert_eq!(acc.total, 10);
    }
}
