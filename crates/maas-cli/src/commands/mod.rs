//! CLI command implementations.
//!
//! Each submodule corresponds to a group of top-level CLI commands and goes
//! through the maas-core `OrchestrationManager`. Commands return the JSON
//! document to print; `main` does the printing.

pub mod evaluate;
pub mod feedback;
pub mod workflow;

use maas_core::config::MaasConfig;
use maas_core::models::Proposal;
use maas_core::OrchestrationManager;

/// Load the configuration file (defaults when absent) and apply the
/// `--db` override.
pub fn load_config(config_path: Option<&str>, db_path: Option<&str>) -> Result<MaasConfig, String> {
    let mut config = match config_path {
        Some(path) => MaasConfig::from_file(path).map_err(|e| e.to_string())?,
        None => MaasConfig::default(),
    };
    if let Some(db) = db_path {
        config.db_path = db.to_string();
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Build the manager over the SQLite store named in the configuration.
pub fn init_manager(config: &MaasConfig) -> Result<OrchestrationManager, String> {
    OrchestrationManager::from_config(config)
        .map_err(|e| format!("Failed to initialize MAAS at '{}': {}", config.db_path, e))
}

/// Read a proposal JSON file.
pub fn load_proposal(path: &str) -> Result<Proposal, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read proposal file '{}': {}", path, e))?;
    Proposal::from_json(&content).map_err(|e| e.to_string())
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to serialize output: {}", e))
}
