//! On-disk layout of tunnel configuration files.
//!
//! Each role has its own directory under the data dir (`frpc/`, `frps/`). The
//! supervisor never writes configuration content; this module only lays out the
//! directories, lists what is there and resolves identities to absolute paths.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::identity::{ConfigIdentity, Role};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, role: Role) -> PathBuf {
        self.root.join(role.dir_name())
    }

    /// Absolute path of the file backing `identity`.
    ///
    /// Fails when the file name would resolve outside the role directory.
    pub fn path(&self, identity: &ConfigIdentity) -> Result<PathBuf> {
        if !identity.has_plain_file_name() {
            bail!("`{}` does not name a file in {}", identity, identity.role().dir_name());
        }
        let path = self.dir(identity.role()).join(identity.file_name());
        if path.is_absolute() {
            return Ok(path);
        }
        Ok(std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path))
    }

    /// False for identities whose file name leaves the role directory.
    pub fn exists(&self, identity: &ConfigIdentity) -> bool {
        self.path(identity).map(|path| path.is_file()).unwrap_or(false)
    }

    /// Creates the per-role directories and moves legacy root-level `*.toml`
    /// files into the client directory.
    ///
    /// A non-directory sitting where a role directory belongs is removed.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create data dir {}", self.root.display()))?;
        for role in Role::ALL {
            let dir = self.dir(role);
            if dir.exists() && !dir.is_dir() {
                fs::remove_file(&dir)
                    .with_context(|| format!("failed to remove stray file {}", dir.display()))?;
            }
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        self.migrate_legacy()
    }

    fn migrate_legacy(&self) -> Result<()> {
        let client_dir = self.dir(Role::Client);
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_toml = path.extension().map(|ext| ext == "toml").unwrap_or(false);
            if !is_toml || !entry.file_type()?.is_file() {
                continue;
            }
            let destination = client_dir.join(entry.file_name());
            match fs::rename(&path, &destination) {
                Ok(()) => tracing::info!(
                    from = %path.display(),
                    to = %destination.display(),
                    "moved legacy config"
                ),
                Err(err) => tracing::warn!(
                    file = %path.display(),
                    error = %err,
                    "failed to move legacy config"
                ),
            }
        }
        Ok(())
    }

    /// Configurations of `role`, sorted by file name. A missing directory lists as empty.
    pub fn list(&self, role: Role) -> Result<Vec<ConfigIdentity>> {
        let dir = self.dir(role);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()))
            }
        };
        let mut identities = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                identities.push(ConfigIdentity::new(role, name));
            }
        }
        identities.sort();
        Ok(identities)
    }
}
