use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::ServerConfig;
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/litesentry/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub backup_directory: PathBuf,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    pub recent_jobs_limit: usize,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub ssh_retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub shutdown_timeout_secs: u64,
    /// Global allow-list used when a server has no allowed roots of its own.
    pub allowed_roots: Vec<String>,
    pub mask_secrets: bool,
    pub rpc_bind: SocketAddr,
    pub verbose: bool,
    pub log_json: bool,
    pub discovery: DiscoveryConfig,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub batch_size: usize,
    pub suffixes: Vec<String>,
    pub excluded_dirs: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            suffixes: [".db", ".sqlite", ".sqlite3"]
                .into_iter()
                .map(String::from)
                .collect(),
            excluded_dirs: [
                "/proc",
                "/sys",
                "/dev",
                "/run",
                "/tmp",
                "/var/tmp",
                "/var/cache",
                "/var/lib/docker",
                "/var/lib/containerd",
                "/snap",
                "/usr/share",
                "/home/*/.cache",
                "/home/*/.mozilla",
                "/home/*/.config",
                "/root/.cache",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/litesentry/jobs.db"),
            backup_directory: PathBuf::from("/var/lib/litesentry/backups"),
            max_concurrent_jobs: 4,
            queue_capacity: 1000,
            recent_jobs_limit: 100,
            command_timeout_secs: 300,
            connect_timeout_secs: 15,
            ssh_retry_attempts: 3,
            retry_backoff_ms: 500,
            shutdown_timeout_secs: 30,
            allowed_roots: Vec::new(),
            mask_secrets: true,
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            verbose: false,
            log_json: false,
            discovery: DiscoveryConfig::default(),
            servers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Layered load: defaults, then the TOML file, then `LITESENTRY_*`
    /// environment variables, then CLI overrides.
    pub fn new<T: Serialize>(config_path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LITESENTRY_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_jobs",
                reason: "must be at least 1".into(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.discovery.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "discovery.batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.discovery.suffixes.is_empty() {
            return Err(ConfigError::Invalid {
                field: "discovery.suffixes",
                reason: "at least one suffix is required".into(),
            });
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Serialize)]
    struct Overrides {
        max_concurrent_jobs: usize,
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.recent_jobs_limit, 100);
        assert_eq!(config.discovery.batch_size, 50);
        assert!(config.mask_secrets);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_then_overrides_are_layered() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
max_concurrent_jobs = 2
allowed_roots = ["/srv"]

[[servers]]
name = "prod"
host = "10.0.0.5"
username = "ops"
auth = "key"
private_key_path = "/home/ops/.ssh/id_ed25519"
"#
        )
        .unwrap();

        let config = AppConfig::new(
            Some(file.path()),
            Some(&Overrides {
                max_concurrent_jobs: 8,
            }),
        )
        .unwrap();

        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.allowed_roots, vec!["/srv".to_string()]);
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].port, 22);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = AppConfig {
            max_concurrent_jobs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
