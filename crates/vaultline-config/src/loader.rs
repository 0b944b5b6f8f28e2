//! Layered loading of [`VaultlineConfig`]
//!
//! Sources, lowest precedence first: built-in defaults, the user config
//! file, `vaultline.toml`, `vaultline.local.toml`, then `VAULTLINE_*`
//! environment variables (`VAULTLINE_RUN__SEED=7`).

use crate::{Paths, VaultlineConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Loader rooted at the nearest directory above the working directory
    /// that holds a `vaultline.toml`, or the working directory itself.
    pub fn new() -> Self {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            project_dir: Paths::find_project_dir(&cwd).unwrap_or(cwd),
            env_prefix: "VAULTLINE".to_string(),
            include_user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Ignore the per-user config file.
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Config files that [`load`](Self::load) would read, in merge order.
    pub fn files(&self) -> Vec<PathBuf> {
        Paths::new().layered_files(&self.project_dir, self.include_user_config)
    }

    /// Merges every source, validates, and resolves relative paths against
    /// the project directory.
    pub fn load(self) -> Result<VaultlineConfig> {
        let defaults = config::Config::try_from(&VaultlineConfig::default())
            .context("Failed to serialize built-in defaults")?;
        let mut builder = config::Config::builder().add_source(defaults);

        for file in self.files() {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut loaded: VaultlineConfig = builder
            .build()
            .context("Failed to merge configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        loaded.validate().context("Configuration failed validation")?;
        loaded.resolve_paths(&self.project_dir);
        Ok(loaded)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
