//! Remote database discovery.
//!
//! One filtered `find` locates candidate files, allowed-root filtering scopes
//! them, and batched `stat` calls enrich each file with metadata. A file
//! whose metadata cannot be read is still reported, with unknown fields.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{Transport, shell_quote};
use super::{DiscoveredDbFile, ServerConfig};
use crate::config::AppConfig;

/// Line printed by the stat command for a path it could not stat.
const STAT_ERROR: &str = "ERROR";
const STAT_FORMAT: &str = "%s|%y|%U|%A";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("filesystem scan failed on {server}: {reason}")]
    Scan { server: String, reason: String },

    #[error("discovery cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub batch_size: usize,
    pub suffixes: Vec<String>,
    pub excluded_dirs: Vec<String>,
    /// Used when a server has no allowed roots of its own.
    pub global_allowed_roots: Vec<String>,
}

impl From<&AppConfig> for DiscoveryOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.discovery.batch_size.max(1),
            suffixes: config.discovery.suffixes.clone(),
            excluded_dirs: config.discovery.excluded_dirs.clone(),
            global_allowed_roots: config.allowed_roots.clone(),
        }
    }
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Phase callback: `(percent, phase)`.
pub type DiscoveryProgress<'a> = &'a (dyn Fn(u8, &str) + Send + Sync);

pub struct Discovery {
    transport: Arc<dyn Transport>,
    options: DiscoveryOptions,
}

impl Discovery {
    pub fn new(transport: Arc<dyn Transport>, options: DiscoveryOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// Find database files on `server` under `search_root` (default `/`).
    pub async fn discover(
        &self,
        server: &ServerConfig,
        search_root: Option<&str>,
        cancel: &CancellationToken,
        progress: Option<DiscoveryProgress<'_>>,
    ) -> Result<Vec<DiscoveredDbFile>, DiscoveryError> {
        let report = |percent: u8, phase: &str| {
            if let Some(cb) = progress {
                cb(percent, phase);
            }
        };

        let root = search_root.unwrap_or("/");
        report(0, "scanning");
        let command = build_scan_command(
            root,
            &self.options.suffixes,
            &self.options.excluded_dirs,
            server.sudo_for_discovery,
        );
        let scan = self.transport.execute_command(server, &command, cancel).await;
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        if !scan.success {
            return Err(DiscoveryError::Scan {
                server: server.name.clone(),
                reason: scan.failure_reason(),
            });
        }

        let candidates = parse_scan_output(&scan.stdout, &self.options.suffixes);
        let found = candidates.len();
        let candidates = filter_allowed(
            candidates,
            &server.allowed_roots,
            &self.options.global_allowed_roots,
        );
        info!(
            server = %server.name,
            found,
            allowed = candidates.len(),
            "Filesystem scan complete"
        );
        report(10, "enriching");

        let batch_size = self.options.batch_size.max(1);
        let batches = candidates.len().div_ceil(batch_size).max(1);
        let mut files = Vec::with_capacity(candidates.len());

        for (index, batch) in candidates.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }
            files.extend(self.enrich_batch(server, batch, cancel).await);
            let percent = 10 + ((index + 1) * 90 / batches) as u8;
            report(percent.min(99), "enriching");
        }

        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        report(100, "complete");
        Ok(files)
    }

    async fn enrich_batch(
        &self,
        server: &ServerConfig,
        paths: &[String],
        cancel: &CancellationToken,
    ) -> Vec<DiscoveredDbFile> {
        let command = build_stat_command(paths, server.sudo_for_discovery);
        let result = self.transport.execute_command(server, &command, cancel).await;

        if result.success {
            match parse_stat_batch(paths, &result.stdout) {
                Ok(files) => return files,
                Err(Misaligned { expected, actual }) => {
                    warn!(
                        server = %server.name,
                        expected,
                        actual,
                        "Stat output misaligned, checking files individually"
                    );
                }
            }
        } else {
            warn!(
                server = %server.name,
                batch = paths.len(),
                reason = %result.failure_reason(),
                "Batched stat failed, checking files individually"
            );
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            if cancel.is_cancelled() {
                files.push(DiscoveredDbFile::unknown(path.as_str()));
                continue;
            }
            let command = build_stat_command(std::slice::from_ref(path), server.sudo_for_discovery);
            let single = self.transport.execute_command(server, &command, cancel).await;
            let file = match single.stdout.lines().next() {
                Some(line) if single.success => parse_stat_line(path, line),
                _ => {
                    debug!(path = %path, "Metadata unavailable");
                    DiscoveredDbFile::unknown(path.as_str())
                }
            };
            files.push(file);
        }
        files
    }
}

fn wrap_sudo(script: String, sudo: bool) -> String {
    if sudo {
        format!("sudo -n sh -c {}", shell_quote(&script))
    } else {
        script
    }
}

/// The single filesystem scan. A missing root exits 2 with a message on
/// stderr; past that guard, unreadable paths are silenced and the script
/// exits 0.
pub fn build_scan_command(
    root: &str,
    suffixes: &[String],
    excluded_dirs: &[String],
    sudo: bool,
) -> String {
    let prune = excluded_dirs
        .iter()
        .map(|dir| format!("-path {}", shell_quote(dir)))
        .collect::<Vec<_>>()
        .join(" -o ");
    let names = suffixes
        .iter()
        .map(|suffix| format!("-name {}", shell_quote(&format!("*{}", suffix))))
        .collect::<Vec<_>>()
        .join(" -o ");

    let root = shell_quote(root);
    let find = if prune.is_empty() {
        format!("find {} -type f \\( {} \\) -print", root, names)
    } else {
        format!(
            "find {} \\( {} \\) -prune -o -type f \\( {} \\) -print",
            root, prune, names
        )
    };
    let script = format!(
        "[ -d {root} ] || {{ echo 'no such directory:' {root} >&2; exit 2; }}; {find} 2>/dev/null; true",
        root = root,
        find = find
    );
    wrap_sudo(script, sudo)
}

/// Newline-delimited scan output to candidate paths: blank lines and paths
/// without a database suffix are dropped, duplicates are removed.
pub fn parse_scan_output(output: &str, suffixes: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .filter(|line| suffixes.iter().any(|s| line.ends_with(s.as_str())))
        .filter(|line| seen.insert(line.to_string()))
        .map(String::from)
        .collect()
}

/// One round trip that prints one line per path, `ERROR` for paths that
/// cannot be stat'ed.
pub fn build_stat_command(paths: &[String], sudo: bool) -> String {
    let script = paths
        .iter()
        .map(|path| {
            format!(
                "stat -c {} -- {} 2>/dev/null || echo {}",
                shell_quote(STAT_FORMAT),
                shell_quote(path),
                STAT_ERROR
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    wrap_sudo(script, sudo)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Misaligned {
    pub expected: usize,
    pub actual: usize,
}

/// Match stat output lines to `paths` by position.
pub fn parse_stat_batch(
    paths: &[String],
    output: &str,
) -> Result<Vec<DiscoveredDbFile>, Misaligned> {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() != paths.len() {
        return Err(Misaligned {
            expected: paths.len(),
            actual: lines.len(),
        });
    }
    Ok(paths
        .iter()
        .zip(lines)
        .map(|(path, line)| parse_stat_line(path, line))
        .collect())
}

/// Parse `size|mtime|owner|permissions`. Fields that do not parse are left
/// unknown; the file itself is always returned.
pub fn parse_stat_line(path: &str, line: &str) -> DiscoveredDbFile {
    let line = line.trim();
    if line == STAT_ERROR {
        return DiscoveredDbFile::unknown(path);
    }
    let parts: Vec<&str> = line.splitn(4, '|').collect();
    if parts.len() != 4 {
        return DiscoveredDbFile::unknown(path);
    }

    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };

    DiscoveredDbFile {
        path: path.to_string(),
        size: parts[0].trim().parse().ok(),
        modified: parse_stat_time(parts[1]),
        owner: non_empty(parts[2]),
        permissions: non_empty(parts[3]),
    }
}

/// `stat %y` looks like `2024-01-01 00:00:00.123456789 +0000`; the
/// fractional part is optional.
fn parse_stat_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Per-server roots win; otherwise the global list applies; with neither,
/// nothing is filtered.
pub fn filter_allowed<T: AsRef<str>>(
    paths: Vec<T>,
    server_roots: &[String],
    global_roots: &[String],
) -> Vec<T> {
    let roots = if !server_roots.is_empty() {
        server_roots
    } else {
        global_roots
    };
    if roots.is_empty() {
        return paths;
    }
    paths
        .into_iter()
        .filter(|p| is_path_allowed(p.as_ref(), roots))
        .collect()
}

pub fn is_path_allowed(path: &str, roots: &[String]) -> bool {
    roots.iter().any(|root| {
        let root = if root.len() > 1 {
            root.trim_end_matches('/')
        } else {
            root.as_str()
        };
        root == "/" || path == root || path.starts_with(&format!("{}/", root))
    })
}
