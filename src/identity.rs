//! Identity of a tunnel configuration.
//!
//! A configuration is named by its role (which binary runs it) and its file name
//! inside that role's directory. `ConfigIdentity` is the key used by the supervisor,
//! the settings store and the control surface.

use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// Which of the two tunnel binaries a configuration belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Tunnel client (`frpc`).
    #[value(alias = "frpc")]
    Client,
    /// Tunnel server (`frps`).
    #[value(alias = "frps")]
    Server,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Client, Role::Server];

    /// Name of the per-role directory under the data dir.
    pub fn dir_name(self) -> &'static str {
        match self {
            Role::Client => "frpc",
            Role::Server => "frps",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" | "frpc" => Ok(Role::Client),
            "server" | "frps" => Ok(Role::Server),
            other => Err(anyhow!("unknown role `{}` (expected client or server)", other)),
        }
    }
}

/// Value identity of one configuration: role plus file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigIdentity {
    role: Role,
    file_name: String,
}

impl ConfigIdentity {
    pub fn new(role: Role, file_name: impl Into<String>) -> Self {
        Self {
            role,
            file_name: file_name.into(),
        }
    }

    /// Like `new`, but rejects names that are not a single plain path component.
    pub fn try_new(role: Role, file_name: impl Into<String>) -> Result<Self> {
        let file_name = file_name.into();
        if !is_plain_file_name(&file_name) {
            bail!("`{}` is not a plain file name", file_name);
        }
        Ok(Self { role, file_name })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Whether the file name stays inside the role directory when joined onto it.
    pub fn has_plain_file_name(&self) -> bool {
        is_plain_file_name(&self.file_name)
    }
}

/// True for `home.toml`; false for empty names, `..`, `./x`, `a/b` or absolute paths.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(only)), None) => only == name,
        _ => false,
    }
}

impl fmt::Display for ConfigIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.file_name)
    }
}

/// Parses `role:file_name`, e.g. `client:home.toml`.
impl FromStr for ConfigIdentity {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (role, file_name) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("expected ROLE:FILE, got `{}`", value))?;
        let role = role.parse::<Role>()?;
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(anyhow!("missing file name in `{}`", value));
        }
        ConfigIdentity::try_new(role, file_name)
    }
}
