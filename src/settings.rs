//! Persisted key/value settings.
//!
//! Holds the per-role auto-start lists, the launch-at-boot flag and the opaque
//! provider token. Keys this crate does not know about are kept and written back
//! untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::identity::Role;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write settings {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings {path} are not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode settings for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub auto_start_client: BTreeSet<String>,
    #[serde(default)]
    pub auto_start_server: BTreeSet<String>,
    /// Whether `run --boot` should bring the supervisor up.
    #[serde(default)]
    pub launch_at_boot: bool,
    /// Credential used by the tunnel provider client; opaque here.
    #[serde(default)]
    pub token: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Settings {
    pub fn auto_start(&self, role: Role) -> &BTreeSet<String> {
        match role {
            Role::Client => &self.auto_start_client,
            Role::Server => &self.auto_start_server,
        }
    }

    fn auto_start_mut(&mut self, role: Role) -> &mut BTreeSet<String> {
        match role {
            Role::Client => &mut self.auto_start_client,
            Role::Server => &mut self.auto_start_server,
        }
    }

    /// Adds or removes `file_name` from the auto-start list. Returns whether it changed.
    pub fn set_auto_start(&mut self, role: Role, file_name: &str, enabled: bool) -> bool {
        let list = self.auto_start_mut(role);
        if enabled {
            list.insert(file_name.to_string())
        } else {
            list.remove(file_name)
        }
    }

    /// Keeps only the entries for which `keep` returns true; returns the pruned names.
    pub fn retain_auto_start<F>(&mut self, role: Role, mut keep: F) -> Vec<String>
    where
        F: FnMut(&str) -> bool,
    {
        let list = self.auto_start_mut(role);
        let pruned: Vec<String> = list.iter().filter(|name| !keep(name.as_str())).cloned().collect();
        for name in &pruned {
            list.remove(name);
        }
        pruned
    }
}

/// JSON file holding `Settings`.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SETTINGS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads settings; a missing file yields defaults.
    pub fn load(&self) -> Result<Settings, SettingsError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Settings::default())
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes settings through a temp file and rename so readers never see a torn file.
    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let write_err = |source: std::io::Error| SettingsError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let raw = serde_json::to_string_pretty(settings).map_err(|source| SettingsError::Encode {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }

    /// Loads, applies `change`, and saves.
    pub fn update<F, T>(&self, change: F) -> Result<T, SettingsError>
    where
        F: FnOnce(&mut Settings) -> T,
    {
        let mut settings = self.load()?;
        let out = change(&mut settings);
        self.save(&settings)?;
        Ok(out)
    }
}
