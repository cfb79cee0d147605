//! Route table - model rewriting and model-to-config pinning
//!
//! A single document drives both kinds of routing:
//! - model-mapping: rewrite the `model` field before forwarding
//! - config-mapping: pin a model name to a specific upstream config

use crate::family::Family;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMode {
    #[default]
    Default,
    ModelMapping,
    ConfigMapping,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    /// Match on the incoming model name.
    #[default]
    Model,
    /// Match on the currently selected config name.
    Config,
}

/// One model-mapping rule. Rules apply in declared order; the first match
/// wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMapping {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub source_type: MappingSource,
}

/// One model-to-config pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapping {
    pub model: String,
    pub config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTable {
    #[serde(default)]
    pub mode: RouteMode,

    #[serde(default, rename = "modelMappings")]
    pub model_mappings: BTreeMap<String, Vec<ModelMapping>>,

    #[serde(default, rename = "configMappings")]
    pub config_mappings: BTreeMap<String, Vec<ConfigMapping>>,
}

impl RouteTable {
    /// Resolve a rewritten model name in model-mapping mode.
    ///
    /// `active_config` is the config that would be selected for this request
    /// and is what `source_type = config` rules match against.
    pub fn rewrite_model(
        &self,
        family: Family,
        model: &str,
        active_config: Option<&str>,
    ) -> Option<String> {
        if self.mode != RouteMode::ModelMapping {
            return None;
        }
        let rules = self.model_mappings.get(family.service_name())?;
        for rule in rules {
            let source = rule.source.trim();
            let target = rule.target.trim();
            if source.is_empty() || target.is_empty() {
                continue;
            }
            let matched = match rule.source_type {
                MappingSource::Model => model == source,
                MappingSource::Config => active_config == Some(source),
            };
            if matched {
                return Some(target.to_string());
            }
        }
        None
    }

    /// Resolve the config a model is pinned to in config-mapping mode.
    pub fn config_for_model(&self, family: Family, model: &str) -> Option<&str> {
        if self.mode != RouteMode::ConfigMapping {
            return None;
        }
        let rules = self.config_mappings.get(family.service_name())?;
        rules
            .iter()
            .find(|rule| !rule.model.trim().is_empty() && rule.model == model)
            .map(|rule| rule.config.as_str())
    }
}
