//! Where configuration files live

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const PROJECT_FILE: &str = "vaultline.toml";
const LOCAL_FILE: &str = "vaultline.local.toml";

/// XDG and project-relative locations used by Vaultline
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("dev", "Vaultline", "vaultline"),
        }
    }

    /// ~/.config/vaultline/config.toml on Linux
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().join("config.toml"))
            .ok_or_else(|| ConfigError::XdgError("no home directory for user config".to_string()))
    }

    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(PROJECT_FILE)
    }

    /// Machine-local overrides, kept out of version control.
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(LOCAL_FILE)
    }

    /// Nearest ancestor of `start` (inclusive) holding a `vaultline.toml`.
    pub fn find_project_dir(start: impl AsRef<Path>) -> Option<PathBuf> {
        start
            .as_ref()
            .ancestors()
            .find(|dir| Self::project_config_file(dir).is_file())
            .map(Path::to_path_buf)
    }

    /// Existing config files for `project_dir`, lowest precedence first.
    pub fn layered_files(&self, project_dir: &Path, include_user: bool) -> Vec<PathBuf> {
        let user = include_user
            .then(|| self.user_config_file().ok())
            .flatten();
        user.into_iter()
            .chain([
                Self::project_config_file(project_dir),
                Self::local_config_file(project_dir),
            ])
            .filter(|path| path.is_file())
            .collect()
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_user_config_location() {
        if let Ok(file) = Paths::new().user_config_file() {
            assert!(file.to_string_lossy().contains("vaultline"));
            assert!(file.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_layered_files_skip_missing() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let dir = temp_dir.path();
        let paths = Paths::new();

        assert!(paths.layered_files(dir, false).is_empty());

        std::fs::write(dir.join(LOCAL_FILE), "").expect("write local");
        std::fs::write(dir.join(PROJECT_FILE), "").expect("write project");
        assert_eq!(
            paths.layered_files(dir, false),
            vec![dir.join(PROJECT_FILE), dir.join(LOCAL_FILE)]
        );
    }

    #[test]
    fn test_find_project_dir_walks_up() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path();
        let nested = root.join("runs").join("nightly");
        std::fs::create_dir_all(&nested).expect("mkdir");

        assert_eq!(Paths::find_project_dir(&nested), None);

        std::fs::write(root.join(PROJECT_FILE), "[run]\n").expect("write project");
        assert_eq!(Paths::find_project_dir(&nested), Some(root.to_path_buf()));
    }
}
