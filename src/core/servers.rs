//! Server and credential records.
//!
//! Records are supplied by configuration (or the caller) per operation; the
//! crate never writes secret material anywhere.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    Password,
    Key,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Key => "key",
        }
    }
}

fn default_port() -> u16 {
    22
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth: AuthKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub sudo_for_discovery: bool,
    #[serde(default)]
    pub allowed_roots: Vec<String>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .field("sudo_for_discovery", &self.sudo_for_discovery)
            .field("allowed_roots", &self.allowed_roots)
            .finish_non_exhaustive()
    }
}

/// Authentication material resolved from a server record.
pub enum Credentials<'a> {
    Password(&'a str),
    KeyData {
        key: &'a str,
        passphrase: Option<&'a str>,
    },
    KeyFile {
        path: &'a std::path::Path,
        passphrase: Option<&'a str>,
    },
}

impl ServerConfig {
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(&self.host, self.port, &self.username)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Select the secret for the configured auth kind. There is no fallback
    /// from one kind to the other.
    pub fn credentials(&self) -> Result<Credentials<'_>, ConfigError> {
        match self.auth {
            AuthKind::Password => self
                .password
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(Credentials::Password)
                .ok_or_else(|| ConfigError::MissingSecret {
                    server: self.name.clone(),
                    kind: AuthKind::Password.as_str(),
                    missing: "password",
                }),
            AuthKind::Key => {
                let passphrase = self.passphrase.as_deref();
                if let Some(key) = self.private_key_data.as_deref().filter(|k| !k.is_empty()) {
                    return Ok(Credentials::KeyData { key, passphrase });
                }
                if let Some(path) = self.private_key_path.as_deref() {
                    return Ok(Credentials::KeyFile { path, passphrase });
                }
                Err(ConfigError::MissingSecret {
                    server: self.name.clone(),
                    kind: AuthKind::Key.as_str(),
                    missing: "private key",
                })
            }
        }
    }

    /// Secret strings that must never appear in logs.
    pub fn secrets(&self) -> Vec<&str> {
        [self.password.as_deref(), self.passphrase.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Identifies a reusable session: `host:port:username`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(String);

impl PoolKey {
    pub fn new(host: &str, port: u16, username: &str) -> Self {
        Self(format!("{}:{}:{}", host, port, username))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lookup of configured servers by name.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: HashMap<String, ServerConfig>,
}

impl ServerRegistry {
    pub fn new(servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        Self {
            servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&ServerConfig, ConfigError> {
        self.servers
            .get(name)
            .ok_or_else(|| ConfigError::UnknownServer(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.values()
    }
}
