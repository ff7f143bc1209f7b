//! Layered settings: project file, then `$DEVTRACK_HOME/config.toml`, then
//! built-in defaults. A layer that fails to load is skipped with a warning.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_STATE_DIR: &str = ".devtrack";
pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_DONE_STATUS: &str = "done";

const PROJECT_CONFIG_FILES: [&str; 2] = [".devtrack.toml", ".devtrackrc"];
const GLOBAL_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DevtrackConfig {
    /// Directory under the working-tree root holding the session marker,
    /// the progress document and the audit log.
    pub state_dir: Option<String>,
    /// Remote whose default branch anchors the baseline merge-base.
    pub remote: Option<String>,
    /// Default branch name; when unset `main` then `master` are probed.
    pub default_branch: Option<String>,
    /// Status value that marks a task as finished.
    pub done_status: Option<String>,
}

/// Which layer supplied a setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigLayer {
    Project,
    Global,
    #[default]
    Default,
}

impl ConfigLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigLayer::Project => "project",
            ConfigLayer::Global => "global",
            ConfigLayer::Default => "default",
        }
    }
}

/// Effective settings after layering project, global and built-in values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub state_dir: String,
    pub remote: String,
    pub default_branches: Vec<String>,
    pub done_status: String,
    pub state_dir_source: ConfigLayer,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            state_dir: DEFAULT_STATE_DIR.to_string(),
            remote: DEFAULT_REMOTE.to_string(),
            default_branches: vec!["main".to_string(), "master".to_string()],
            done_status: DEFAULT_DONE_STATUS.to_string(),
            state_dir_source: ConfigLayer::Default,
        }
    }
}

impl SessionSettings {
    pub fn resolve(repo_root: &Path) -> Self {
        let layers = [
            (ConfigLayer::Project, skip_broken(load_project_config(repo_root))),
            (ConfigLayer::Global, skip_broken(load_global_config())),
        ];

        let mut settings = Self::default();
        if let Some((value, layer)) = layered(&layers, |c| c.state_dir.as_deref()) {
            settings.state_dir = value;
            settings.state_dir_source = layer;
        }
        if let Some((value, _)) = layered(&layers, |c| c.remote.as_deref()) {
            settings.remote = value;
        }
        if let Some((branch, _)) = layered(&layers, |c| c.default_branch.as_deref()) {
            settings.default_branches = vec![branch];
        }
        if let Some((value, _)) = layered(&layers, |c| c.done_status.as_deref()) {
            settings.done_status = value;
        }
        settings
    }

    pub fn state_dir_path(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.state_dir)
    }
}

fn skip_broken(loaded: Result<Option<DevtrackConfig>, ConfigError>) -> Option<DevtrackConfig> {
    loaded.unwrap_or_else(|err| {
        warn!(error = %err, "ignoring config layer");
        None
    })
}

/// First non-empty value across layers, highest priority first.
fn layered(
    layers: &[(ConfigLayer, Option<DevtrackConfig>)],
    select: impl Fn(&DevtrackConfig) -> Option<&str>,
) -> Option<(String, ConfigLayer)> {
    layers.iter().find_map(|(layer, config)| {
        let value = select(config.as_ref()?)?.trim();
        (!value.is_empty()).then(|| (value.to_string(), *layer))
    })
}

fn env_path(name: &str) -> Option<PathBuf> {
    let value = std::env::var(name).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

/// `$DEVTRACK_HOME`, else `.devtrack` under the user's home directory.
pub fn devtrack_home() -> Option<PathBuf> {
    env_path("DEVTRACK_HOME").or_else(|| {
        env_path("HOME")
            .or_else(|| env_path("USERPROFILE"))
            .map(|home| home.join(".devtrack"))
    })
}

/// Loads the first project config file present at `repo_root`.
pub fn load_project_config(repo_root: &Path) -> Result<Option<DevtrackConfig>, ConfigError> {
    PROJECT_CONFIG_FILES
        .iter()
        .map(|name| repo_root.join(name))
        .find(|path| path.is_file())
        .map(|path| read_config(&path))
        .transpose()
}

pub fn load_global_config() -> Result<Option<DevtrackConfig>, ConfigError> {
    let Some(path) = devtrack_home().map(|home| home.join(GLOBAL_CONFIG_FILE)) else {
        return Ok(None);
    };
    if !path.is_file() {
        return Ok(None);
    }
    read_config(&path).map(Some)
}

fn read_config(path: &Path) -> Result<DevtrackConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use tempfile::TempDir;

    struct HomeOverride {
        previous: Option<OsString>,
    }

    impl HomeOverride {
        fn set(path: &Path) -> Self {
            let previous = std::env::var_os("DEVTRACK_HOME");
            std::env::set_var("DEVTRACK_HOME", path);
            Self { previous }
        }
    }

    impl Drop for HomeOverride {
        fn drop(&mut self) {
            match self.previous.take() {
                Some(value) => std::env::set_var("DEVTRACK_HOME", value),
                None => std::env::remove_var("DEVTRACK_HOME"),
            }
        }
    }

    #[test]
    fn unparsable_project_config_reports_path() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join(".devtrack.toml"), "state_dir = [").expect("write");
        let err = load_project_config(temp.path()).expect_err("bad toml");
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(".devtrack.toml"));
    }

    #[test]
    fn rc_file_is_the_fallback_name() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join(".devtrackrc"), "remote = \"upstream\"\n").expect("write");
        let config = load_project_config(temp.path()).expect("load").expect("config");
        assert_eq!(config.remote.as_deref(), Some("upstream"));
    }

    #[test]
    fn settings_layer_project_over_global_over_default() {
        let _lock = crate::test_env::lock();
        let repo = TempDir::new().expect("repo tempdir");
        let home = TempDir::new().expect("home tempdir");
        let _home = HomeOverride::set(home.path());

        assert_eq!(SessionSettings::resolve(repo.path()), SessionSettings::default());

        fs::write(
            home.path().join("config.toml"),
            "state_dir = \".global-state\"\ndone_status = \"completed\"\n",
        )
        .expect("global config");
        let settings = SessionSettings::resolve(repo.path());
        assert_eq!(settings.state_dir, ".global-state");
        assert_eq!(settings.state_dir_source, ConfigLayer::Global);
        assert_eq!(settings.done_status, "completed");

        fs::write(
            repo.path().join(".devtrack.toml"),
            "state_dir = \".project-state\"\ndefault_branch = \"develop\"\n",
        )
        .expect("project config");
        let settings = SessionSettings::resolve(repo.path());
        assert_eq!(settings.state_dir, ".project-state");
        assert_eq!(settings.state_dir_source, ConfigLayer::Project);
        assert_eq!(settings.default_branches, vec!["develop".to_string()]);
        assert_eq!(settings.done_status, "completed");
        assert_eq!(settings.remote, "origin");
    }

    #[test]
    fn broken_project_layer_falls_through_to_global() {
        let _lock = crate::test_env::lock();
        let repo = TempDir::new().expect("repo tempdir");
        let home = TempDir::new().expect("home tempdir");
        let _home = HomeOverride::set(home.path());

        fs::write(home.path().join("config.toml"), "state_dir = \".shared\"\n").expect("global");
        fs::write(repo.path().join(".devtrack.toml"), "state_dir = ").expect("project");
        let settings = SessionSettings::resolve(repo.path());
        assert_eq!(settings.state_dir, ".shared");
        assert_eq!(settings.state_dir_source, ConfigLayer::Global);
    }
}
