// Family definitions - the three wire-protocol shapes the proxy fronts
//
// Each family is an independent HTTP service bound to a fixed local port.
// The family decides the canonical API path, the upstream header set, and
// which body transformations apply before forwarding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three upstream protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Anthropic Messages (`/v1/messages`)
    Claude,
    /// OpenAI Responses (`/v1/responses`)
    Codex,
    /// OpenAI Chat Completions (`/v1/chat/completions`)
    Legacy,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Claude, Family::Codex, Family::Legacy];

    /// Service identifier used in config files, log records, and events.
    pub fn service_name(&self) -> &'static str {
        match self {
            Family::Claude => "claude",
            Family::Codex => "codex",
            Family::Legacy => "legacy",
        }
    }

    /// Compiled-in local port for this family's service.
    pub fn port(&self) -> u16 {
        match self {
            Family::Claude => 3210,
            Family::Codex => 3211,
            Family::Legacy => 3212,
        }
    }

    /// The canonical API path for this family.
    pub fn canonical_path(&self) -> &'static str {
        match self {
            Family::Claude => "/v1/messages",
            Family::Codex => "/v1/responses",
            Family::Legacy => "/v1/chat/completions",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.service_name())
    }
}
