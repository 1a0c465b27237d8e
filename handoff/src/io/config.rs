//! Deployment configuration loaded from a TOML file.
//!
//! The configuration is an explicit typed structure validated eagerly at
//! load: every required setting is a named field, so a broken file fails at
//! startup instead of at the first operation that happens to need the
//! missing key.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// Top-level deployment configuration (TOML).
///
/// ```toml
/// root = "/srv/handoff"
///
/// [apps.demo]
/// repository = "https://example.org/demo.git"
/// entry_point = "app.ini"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployConfig {
    /// Directory holding one subtree per application. Must already exist.
    pub root: PathBuf,

    /// How long to wait for a started process to leave `Starting`.
    #[serde(default = "default_start_patience_secs")]
    pub start_patience_secs: u64,

    /// Wall-clock bound for checkout, fetch, and install subprocesses.
    #[serde(default = "default_subprocess_timeout_secs")]
    pub subprocess_timeout_secs: u64,

    /// Applications keyed by name.
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,
}

/// Per-application settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Source repository the slots are cloned from.
    pub repository: String,
    /// Launch configuration path inside a slot, handed to the supervisor.
    pub entry_point: PathBuf,
}

fn default_start_patience_secs() -> u64 {
    60
}

fn default_subprocess_timeout_secs() -> u64 {
    600
}

impl DeployConfig {
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(DeployError::Configuration(
                "no root folder provided".to_string(),
            ));
        }
        if !self.root.is_dir() {
            return Err(DeployError::Configuration(format!(
                "provided root folder does not exist: {}",
                self.root.display()
            )));
        }
        if self.start_patience_secs == 0 {
            return Err(DeployError::Configuration(
                "start_patience_secs must be > 0".to_string(),
            ));
        }
        if self.subprocess_timeout_secs == 0 {
            return Err(DeployError::Configuration(
                "subprocess_timeout_secs must be > 0".to_string(),
            ));
        }
        for (name, app) in &self.apps {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
            {
                return Err(DeployError::Configuration(format!(
                    "invalid application name '{name}' (use [a-z0-9_-])"
                )));
            }
            if app.repository.is_empty() {
                return Err(DeployError::Configuration(format!(
                    "no repository provided for {name}"
                )));
            }
            if app.entry_point.as_os_str().is_empty() || app.entry_point.is_absolute() {
                return Err(DeployError::Configuration(format!(
                    "entry point for {name} must be a relative path inside the slot"
                )));
            }
        }
        Ok(())
    }
}

/// Load and validate the configuration file.
pub fn load_config(path: &Path) -> Result<DeployConfig> {
    let contents = fs::read_to_string(path)
        .map_err(|err| DeployError::Configuration(format!("read {}: {err}", path.display())))?;
    let config: DeployConfig = toml::from_str(&contents)
        .map_err(|err| DeployError::Configuration(format!("parse {}: {err}", path.display())))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_toml(root: &Path) -> String {
        format!(
            "root = \"{}\"\n\n[apps.demo]\nrepository = \"https://example.org/demo.git\"\nentry_point = \"app.ini\"\n",
            root.display()
        )
    }

    #[test]
    fn load_parses_apps_and_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("handoff.toml");
        fs::write(&path, valid_toml(temp.path())).expect("write");

        let config = load_config(&path).expect("load");
        assert_eq!(config.root, temp.path());
        assert_eq!(config.start_patience_secs, 60);
        let demo = config.apps.get("demo").expect("demo app");
        assert_eq!(demo.entry_point, PathBuf::from("app.ini"));
    }

    #[test]
    fn load_rejects_missing_root_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("handoff.toml");
        let missing = temp.path().join("nowhere");
        fs::write(
            &path,
            format!("root = \"{}\"\n", missing.display()),
        )
        .expect("write");

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)), "{err}");
    }

    #[test]
    fn load_rejects_absolute_entry_point() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("handoff.toml");
        fs::write(
            &path,
            format!(
                "root = \"{}\"\n\n[apps.demo]\nrepository = \"x\"\nentry_point = \"/etc/app.ini\"\n",
                temp.path().display()
            ),
        )
        .expect("write");

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("entry point"), "{err}");
    }

    #[test]
    fn validate_rejects_missing_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut apps = BTreeMap::new();
        apps.insert(
            "demo".to_string(),
            AppConfig {
                repository: String::new(),
                entry_point: PathBuf::from("app.ini"),
            },
        );
        let config = DeployConfig {
            root: temp.path().to_path_buf(),
            start_patience_secs: 60,
            subprocess_timeout_secs: 600,
            apps,
        };
        assert!(config.validate().is_err());
    }
}
