use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use confdb_backup::EngineSettings;
use confdb_types::Oid;

/// The general configuration options struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Backup document the database is seeded from on start-up and
    /// persisted back into after a mutating command.
    pub bootstrap: PathBuf,
}

/// The reconciliation engine options (`[engine]` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on reconciliation passes before the engine declares a
    /// dependency loop.
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,
    /// Subtree whose instances mirror remote agents.
    #[serde(default = "default_agent_subtree")]
    pub agent_subtree: Oid,
}

fn default_max_passes() -> u32 {
    EngineSettings::default().max_passes
}

fn default_agent_subtree() -> Oid {
    EngineSettings::default().agent_subtree
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_passes: default_max_passes(),
            agent_subtree: default_agent_subtree(),
        }
    }
}

impl From<EngineConfig> for EngineSettings {
    fn from(config: EngineConfig) -> EngineSettings {
        EngineSettings {
            max_passes: config.max_passes,
            agent_subtree: config.agent_subtree,
        }
    }
}

/// The application configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General instance configuration options.
    pub general: GeneralConfig,
    /// The reconciliation engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
}
