// CLI module - command-line argument parsing
//
// The heavy lifting (service supervision, config editing, the monitoring
// UI) lives in external tooling; this binary only needs to run the family
// services and point users at the config directory.

use crate::family::Family;
use clap::{Parser, Subcommand};

/// Local multi-upstream reverse proxy for AI CLI clients
#[derive(Parser)]
#[command(name = "cliproxy")]
#[command(version)]
#[command(about = "Local multi-upstream reverse proxy for AI CLI clients", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the family proxy services (default)
    Serve {
        /// Run a single family instead of all three (claude, codex, legacy)
        #[arg(long)]
        family: Option<String>,
    },
    /// Print the config directory path
    Config {
        /// Show the config directory path
        #[arg(long)]
        path: bool,
    },
}

/// Resolve a `--family` argument to the family list to run.
pub fn families_for(arg: Option<&str>) -> Result<Vec<Family>, String> {
    match arg {
        None => Ok(Family::ALL.to_vec()),
        Some(name) => match name.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(vec![Family::Claude]),
            "codex" => Ok(vec![Family::Codex]),
            "legacy" => Ok(vec![Family::Legacy]),
            other => Err(format!(
                "unknown family '{}', expected claude, codex, or legacy",
                other
            )),
        },
    }
}
