//! Load-balance policy - selection mode plus per-family failure state
//!
//! Failure counts and exclusions are session state that happens to be
//! persisted: every change is written through to `loadbalance.json` so the
//! counts an operator sees always match what the pool uses.

use crate::family::Family;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceMode {
    #[default]
    ActiveFirst,
    WeightBased,
}

/// Per-family slice of the policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePolicy {
    #[serde(default = "default_threshold", rename = "failureThreshold")]
    pub failure_threshold: u32,

    #[serde(default, rename = "currentFailures")]
    pub current_failures: BTreeMap<String, u32>,

    #[serde(default, rename = "excludedConfigs")]
    pub excluded_configs: Vec<String>,
}

fn default_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            current_failures: BTreeMap::new(),
            excluded_configs: Vec::new(),
        }
    }
}

impl ServicePolicy {
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded_configs.iter().any(|n| n == name)
    }

    /// Bump the failure counter for a config. Returns the new count and
    /// whether this crossing moved the config into the excluded set.
    pub fn record_failure(&mut self, name: &str) -> (u32, bool) {
        let count = self.current_failures.entry(name.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        let newly_excluded = count >= self.failure_threshold && !self.is_excluded(name);
        if newly_excluded {
            self.excluded_configs.push(name.to_string());
        }
        (count, newly_excluded)
    }

    /// Drop all failure state for a config (operator reset or config edit).
    pub fn reset(&mut self, name: &str) {
        self.current_failures.remove(name);
        self.excluded_configs.retain(|n| n != name);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancePolicy {
    #[serde(default)]
    pub mode: BalanceMode,

    #[serde(default)]
    pub services: BTreeMap<String, ServicePolicy>,
}

impl LoadBalancePolicy {
    /// The default document seeded on first touch: one section per family.
    pub fn seeded() -> Self {
        let mut policy = Self::default();
        for family in Family::ALL {
            policy
                .services
                .insert(family.service_name().to_string(), ServicePolicy::default());
        }
        policy
    }

    pub fn service(&self, family: Family) -> ServicePolicy {
        self.services
            .get(family.service_name())
            .cloned()
            .unwrap_or_default()
    }

    pub fn service_mut(&mut self, family: Family) -> &mut ServicePolicy {
        self.services
            .entry(family.service_name().to_string())
            .or_default()
    }
}
