//! Configuration management for tunnelrack.
//!
//! This module defines the structure of the optional `tunnelrack.toml` file and
//! provides functionality to load and parse it. Every field is optional; command
//! line flags take precedence over file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `tunnelrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding `frpc/`, `frps/` and `settings.json`.
    pub data_dir: Option<PathBuf>,
    /// Program run for client configurations.
    pub client_binary: Option<String>,
    /// Program run for server configurations.
    pub server_binary: Option<String>,
    /// Arguments placed before the config path for client configurations.
    pub client_args: Option<Vec<String>>,
    /// Arguments placed before the config path for server configurations.
    pub server_args: Option<Vec<String>>,
    /// Time to wait after the graceful signal before force-killing (ms).
    pub grace_period_ms: Option<u64>,
    /// Upper bound on retained log bytes.
    pub max_log_bytes: Option<usize>,
    /// Whether to strip ANSI escapes when printing the log.
    pub strip_ansi: Option<bool>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
data_dir = "/var/lib/tunnelrack"
client_binary = "/opt/frp/frpc"
server_binary = "/opt/frp/frps"
client_args = ["-c"]
grace_period_ms = 1500
max_log_bytes = 65536
strip_ansi = true
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/tunnelrack")));
        assert_eq!(config.client_binary.as_deref(), Some("/opt/frp/frpc"));
        assert_eq!(config.server_binary.as_deref(), Some("/opt/frp/frps"));
        assert_eq!(config.client_args, Some(vec!["-c".to_string()]));
        assert_eq!(config.server_args, None);
        assert_eq!(config.grace_period_ms, Some(1500));
        assert_eq!(config.max_log_bytes, Some(65536));
        assert_eq!(config.strip_ansi, Some(true));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.data_dir.is_none());
        assert!(config.grace_period_ms.is_none());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("grace_ms = 10").is_err());
    }
}
