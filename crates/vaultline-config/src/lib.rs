//! Configuration management for Vaultline
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the binary)
//! 2. Environment variables (`VAULTLINE_` prefix, `__` between sections)
//! 3. vaultline.local.toml (gitignored, local overrides)
//! 4. vaultline.toml (git-tracked, project config)
//! 5. ~/.config/vaultline/config.toml (user defaults)
//! 6. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Vaultline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultlineConfig {
    pub run: RunConfig,
    pub timeline: TimelineConfig,
    pub report: ReportConfig,
    /// Action table overrides, keyed by action name.
    pub actions: BTreeMap<String, ActionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub seed: u64,
    /// Number of scheduler iterations before winding down.
    pub iterations: u64,
    /// Run a reconciliation pass every this many iterations.
    pub check_interval: u64,
    /// Simulated seconds skipped at every reconciliation pass.
    pub time_step_secs: u64,
    /// Upper bound on wind-down polling cycles.
    pub wind_down_polls: u32,
    pub mining: MiningMode,
    /// Run the seed twice and compare shadow hashes.
    pub check_determinism: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            iterations: 1_000,
            check_interval: 50,
            time_step_secs: 60,
            wind_down_polls: 100,
            mining: MiningMode::Auto,
            check_determinism: false,
        }
    }
}

/// How submitted transactions are turned into blocks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MiningMode {
    /// Every submission is mined in its own block as soon as it is made.
    #[default]
    Auto,
    /// Submissions queue up until the scheduler mines a block.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Simulated timestamp (seconds) the run starts at.
    pub start_timestamp: u64,
    /// Seconds per underlying-chain block.
    pub underlying_block_interval_secs: u64,
    /// Number of fired timers kept for determinism comparison.
    pub firing_log_capacity: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            start_timestamp: 1_700_000_000,
            underlying_block_interval_secs: 4,
            firing_log_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Where failure reports are written.
    pub output_dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(".vaultline/reports"),
        }
    }
}

/// Weight and fixed triggers of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    pub weight: u32,
    /// Iterations at which the action is spawned regardless of its weight.
    pub at_iterations: Vec<u64>,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            weight: 1,
            at_iterations: Vec::new(),
        }
    }
}

impl VaultlineConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML document on top of the defaults
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Short smoke-test configuration
    pub fn quick() -> Self {
        Self {
            run: RunConfig {
                iterations: 100,
                check_interval: 10,
                wind_down_polls: 20,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.check_interval == 0 {
            return Err(ConfigError::ValidationError(
                "run.check_interval must be at least 1".to_string(),
            ));
        }
        if self.run.wind_down_polls == 0 {
            return Err(ConfigError::ValidationError(
                "run.wind_down_polls must be at least 1".to_string(),
            ));
        }
        if self.timeline.underlying_block_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "timeline.underlying_block_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if self.report.output_dir.is_relative() {
            self.report.output_dir = base.join(&self.report.output_dir);
        }
    }
}
