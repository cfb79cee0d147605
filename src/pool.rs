//! Upstream pool - per-family config selection and failure accounting
//!
//! Selection is invoked once per client request:
//! 1. drop configs currently excluded by the load-balance policy
//! 2. honor a model-to-config pin (no fallback when the pin is excluded)
//! 3. active-first: the sole entry marked active, or weight-based:
//!    weighted random over positive weights (uniform when all are zero)
//!
//! Failure accounting: transport errors and HTTP >= 500 bump the per-config
//! counter; crossing the threshold evicts the config until an operator
//! reset or config edit. 4xx is a client/request fault and never counts.
//! Selection and failure updates are serialized behind one per-family lock
//! so eviction decisions stay consistent.

use crate::config::{BalanceMode, ConfigStore, UpstreamConfig};
use crate::events::RealtimeHub;
use crate::family::Family;
use rand::Rng;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no active upstream configured")]
    NoActiveUpstream,
    #[error("all eligible upstream configs are excluded")]
    UpstreamUnavailable,
}

/// Outcome of one upstream call, fed back into failure accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    Status(u16),
    TransportError,
}

impl UpstreamOutcome {
    fn is_failure(self) -> bool {
        match self {
            UpstreamOutcome::Status(code) => code >= 500,
            UpstreamOutcome::TransportError => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub name: String,
    pub config: UpstreamConfig,
}

pub struct UpstreamPool {
    family: Family,
    store: Arc<ConfigStore>,
    hub: Arc<RealtimeHub>,
    lock: Mutex<()>,
}

impl UpstreamPool {
    pub fn new(family: Family, store: Arc<ConfigStore>, hub: Arc<RealtimeHub>) -> Self {
        Self {
            family,
            store,
            hub,
            lock: Mutex::new(()),
        }
    }

    /// Pick the config for one request. `pinned` comes from the route
    /// table's config-mapping and restricts the pool to that single name.
    pub fn select(&self, pinned: Option<&str>) -> Result<Selection, SelectionError> {
        let _guard = self.lock.lock().unwrap();

        let configs = self.store.upstreams(self.family);
        let policy = self.store.load_balance();
        let service = policy.service(self.family);

        if let Some(name) = pinned {
            // A pinned config that is excluded fails outright; pinning never
            // falls back to the rest of the pool.
            if service.is_excluded(name) {
                return Err(SelectionError::UpstreamUnavailable);
            }
            let config = configs
                .get(name)
                .cloned()
                .ok_or(SelectionError::UpstreamUnavailable)?;
            return Ok(Selection {
                name: name.to_string(),
                config,
            });
        }

        let eligible: Vec<(&String, &UpstreamConfig)> = configs
            .iter()
            .filter(|(name, _)| !service.is_excluded(name))
            .collect();

        match policy.mode {
            BalanceMode::ActiveFirst => eligible
                .iter()
                .find(|(_, config)| config.active)
                .map(|(name, config)| Selection {
                    name: (*name).clone(),
                    config: (*config).clone(),
                })
                .ok_or(SelectionError::NoActiveUpstream),
            BalanceMode::WeightBased => {
                if eligible.is_empty() {
                    return Err(SelectionError::UpstreamUnavailable);
                }
                let (name, config) = pick_weighted(&eligible);
                Ok(Selection {
                    name: name.clone(),
                    config: config.clone(),
                })
            }
        }
    }

    /// Feed the outcome of an upstream call back into the policy. Failures
    /// are written through to `loadbalance.json` so operator-visible counts
    /// always match what selection uses.
    pub fn record_result(&self, name: &str, outcome: UpstreamOutcome) {
        if !outcome.is_failure() {
            return;
        }
        let _guard = self.lock.lock().unwrap();

        let mut policy = self.store.load_balance();
        let service = policy.service_mut(self.family);
        let (failures, newly_excluded) = service.record_failure(name);

        if newly_excluded {
            tracing::warn!(
                "Excluding upstream config '{}' after {} failures ({})",
                name,
                failures,
                self.family
            );
            self.hub.config_excluded(name, failures);
        }

        if let Err(err) = self.store.put_load_balance(&policy) {
            tracing::error!("Failed to persist load-balance state: {}", err);
        }
    }
}

/// Weighted random pick. Entries with weight 0 are skipped unless every
/// entry has weight 0, in which case the draw is uniform.
fn pick_weighted<'a>(
    entries: &[(&'a String, &'a UpstreamConfig)],
) -> (&'a String, &'a UpstreamConfig) {
    let weighted: Vec<(&String, &UpstreamConfig)> = entries
        .iter()
        .filter(|(_, config)| config.weight > 0)
        .copied()
        .collect();

    if weighted.is_empty() {
        let index = rand::rng().random_range(0..entries.len());
        return entries[index];
    }

    let total: u64 = weighted.iter().map(|(_, c)| c.weight.max(1) as u64).sum();
    let mut roll = rand::rng().random_range(0..total);
    for (name, config) in weighted.iter().copied() {
        let weight = config.weight.max(1) as u64;
        if roll < weight {
            return (name, config);
        }
        roll -= weight;
    }
    // Unreachable: roll < total by construction
    weighted[weighted.len() - 1]
}
