//! Control plane configuration.
//!
//! # File Format
//!
//! Stored as `~/.config/marshal/config.json`. Every field is optional;
//! anything missing takes its default.
//!
//! ```json
//! {
//!   "policy": {
//!     "level": "allowlist",
//!     "ask": "on_miss",
//!     "allowlist": ["ls", "git status"],
//!     "originDeny": {"comm": ["clipboard"]}
//!   },
//!   "processes": {"maxOutputBytes": 200000, "finishedTtlMs": 1800000},
//!   "shell": {"defaultTimeoutMs": 120000},
//!   "permissions": {"categories": {"desktop": "desktop_control"}, "granted": []}
//! }
//! ```

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approval::PolicyConfig;
use crate::capability::PermissionFilter;
use crate::process::ProcessConfig;
use crate::tools::ShellConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlPlaneConfig {
    pub policy: PolicyConfig,
    pub processes: ProcessConfig,
    pub shell: ShellConfig,
    pub permissions: PermissionFilter,
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<ControlPlaneConfig, ConfigError> {
    let display = path.display().to_string();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("No config at {}, using defaults", display);
            return Ok(ControlPlaneConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: display,
                source,
            })
        }
    };

    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}

/// Save config to `path` atomically (write to `.tmp`, then rename).
pub fn save_config(path: &Path, config: &ControlPlaneConfig) -> Result<(), ConfigError> {
    let io_err = |source: io::Error| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_err)?;
    }

    let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = Path::new(&temp_name);

    fs::write(temp_path, json).map_err(io_err)?;
    fs::rename(temp_path, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalLevel, AskMode, Origin};
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, ControlPlaneConfig::default());
        assert_eq!(config.policy.level, ApprovalLevel::Allowlist);
        assert_eq!(config.policy.ask, AskMode::OnMiss);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"policy": {"level": "allow_all", "originDeny": {"comm": ["clipboard"]}},
                "processes": {"maxFinishedSessions": 5}}"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.policy.level, ApprovalLevel::AllowAll);
        assert_eq!(config.policy.ask, AskMode::OnMiss);
        assert_eq!(
            config.policy.origin_deny.get(&Origin::Comm),
            Some(&vec!["clipboard".to_string()])
        );
        assert_eq!(config.processes.max_finished_sessions, 5);
        assert_eq!(
            config.processes.max_output_bytes,
            ProcessConfig::default().max_output_bytes
        );
        assert_eq!(config.shell, ShellConfig::default());
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn save_then_load_preserves_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = ControlPlaneConfig::default();
        config.policy.allowlist.push("make test".to_string());
        config.shell.max_result_chars = 1234;
        save_config(&path, &config).unwrap();

        assert!(!dir.path().join("nested").join("config.json.tmp").exists());
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn saved_file_is_camel_case() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        save_config(&path, &ControlPlaneConfig::default()).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"maxOutputBytes\""));
        assert!(raw.contains("\"originDeny\""));
    }
}
