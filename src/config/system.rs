//! System settings - log limit and Codex reasoning defaults
//!
//! Stored in `~/.clp/data/system.json`, edited by the monitoring UI.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_LOG_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Number of request records retained in the in-memory ring.
    #[serde(default = "default_log_limit", rename = "logLimit")]
    pub log_limit: usize,

    /// Default reasoning effort per Codex model.
    #[serde(default, rename = "effortByModel")]
    pub effort_by_model: BTreeMap<String, String>,

    /// Default text verbosity per Codex model.
    #[serde(default, rename = "verbosityByModel")]
    pub verbosity_by_model: BTreeMap<String, String>,

    /// Default reasoning summary mode per Codex model.
    #[serde(default, rename = "summaryByModel")]
    pub summary_by_model: BTreeMap<String, String>,
}

fn default_log_limit() -> usize {
    DEFAULT_LOG_LIMIT
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            log_limit: DEFAULT_LOG_LIMIT,
            effort_by_model: BTreeMap::new(),
            verbosity_by_model: BTreeMap::new(),
            summary_by_model: BTreeMap::new(),
        }
    }
}

impl SystemSettings {
    /// Reasoning effort to backfill for a Codex model.
    ///
    /// Falls back to "medium"; gpt-5-codex does not accept "minimal".
    pub fn default_effort(&self, model: &str) -> &'static str {
        let configured = self
            .effort_by_model
            .get(model)
            .map(|v| v.trim().to_ascii_lowercase());
        let value = match configured.as_deref() {
            Some("minimal") => "minimal",
            Some("low") => "low",
            Some("high") => "high",
            _ => "medium",
        };
        if model == "gpt-5-codex" && value == "minimal" {
            return "medium";
        }
        value
    }

    /// Text verbosity to backfill; empty means leave the field alone.
    pub fn default_verbosity(&self, model: &str) -> &'static str {
        match self
            .verbosity_by_model
            .get(model)
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("low") => "low",
            Some("medium") => "medium",
            Some("high") => "high",
            _ => "",
        }
    }

    /// Reasoning summary mode to backfill.
    pub fn default_summary(&self, model: &str) -> &'static str {
        match self
            .summary_by_model
            .get(model)
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("detailed") => "detailed",
            _ => "auto",
        }
    }
}
