#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use litesentry::core::transport::{CommandResult, ProgressFn, Transport};
use litesentry::core::{ServerConfig, TransferResult};
use tokio_util::sync::CancellationToken;

pub fn server(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        host: format!("{}.example.com", name),
        username: "ops".into(),
        password: Some("hunter2".into()),
        ..Default::default()
    }
}

pub fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        success: true,
        stdout: stdout.to_string(),
        exit_code: Some(0),
        ..Default::default()
    }
}

pub fn exit(code: i32, stderr: &str) -> CommandResult {
    CommandResult {
        success: false,
        stderr: stderr.to_string(),
        exit_code: Some(code),
        ..Default::default()
    }
}

/// Scripted stand-in for the SSH transport.
///
/// Commands are answered by the first rule whose pattern is a substring of
/// the command. Remote files live in memory keyed by `server:path`.
#[derive(Default)]
pub struct FakeTransport {
    rules: Mutex<Vec<(String, CommandResult)>>,
    commands: Mutex<Vec<(String, String)>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// Chunks per transfer; each chunk is one progress callback.
    pub chunks: usize,
    /// Delay between chunks, to give tests a window to cancel.
    pub chunk_delay: Option<Duration>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            chunks: 4,
            ..Default::default()
        }
    }

    pub fn on(&self, pattern: &str, result: CommandResult) -> &Self {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), result));
        self
    }

    pub fn put_file(&self, server: &str, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(format!("{}:{}", server, path), content.to_vec());
    }

    pub fn file(&self, server: &str, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(&format!("{}:{}", server, path))
            .cloned()
    }

    /// Commands run so far, as `(server, command)`.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_matching(&self, pattern: &str) -> usize {
        self.commands()
            .iter()
            .filter(|(_, c)| c.contains(pattern))
            .count()
    }

    async fn stream(
        &self,
        content: &[u8],
        on_progress: &Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<(), u64> {
        let total = content.len() as u64;
        let chunks = self.chunks.max(1) as u64;
        for i in 1..=chunks {
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            let done = total * i / chunks;
            if cancel.is_cancelled() {
                return Err(done);
            }
            if let Some(cb) = on_progress {
                cb(done, Some(total));
            }
        }
        Ok(())
    }
}

impl FakeTransport {
    /// Stand-in for the few shell commands the handlers issue against the
    /// in-memory files: sqlite3 `.backup`, `rm -f` and `cp -p`.
    fn emulate(&self, server: &str, command: &str) -> Option<CommandResult> {
        let args = quoted_args(command);
        if command.contains("sqlite3 ") && command.contains(".backup ") {
            let source = args.first()?;
            let snapshot = args.get(1)?.strip_prefix(".backup ")?;
            let content = self.file(server, source)?;
            self.put_file(server, snapshot, &content);
            return Some(ok(""));
        }
        if command.starts_with("rm -f -- ") {
            let key = format!("{}:{}", server, args.first()?);
            self.files.lock().unwrap().remove(&key);
            return Some(ok(""));
        }
        if command.starts_with("cp -p -- ") {
            let content = self.file(server, args.first()?)?;
            self.put_file(server, args.get(1)?, &content);
            return Some(ok(&format!("{}\n", content.len())));
        }
        None
    }
}

/// Single-quoted arguments of a command, in order. Test paths never contain
/// quotes themselves.
fn quoted_args(command: &str) -> Vec<String> {
    command
        .split('\'')
        .skip(1)
        .step_by(2)
        .map(String::from)
        .collect()
}

fn elapsed(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute_command(
        &self,
        server: &ServerConfig,
        command: &str,
        cancel: &CancellationToken,
    ) -> CommandResult {
        self.commands
            .lock()
            .unwrap()
            .push((server.name.clone(), command.to_string()));
        if cancel.is_cancelled() {
            return CommandResult::failure("operation cancelled", 0);
        }
        let scripted = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, result)| result.clone());
        scripted
            .or_else(|| self.emulate(&server.name, command))
            .unwrap_or_else(|| CommandResult::failure(format!("unscripted command: {}", command), 0))
    }

    async fn test_connection(&self, server: &ServerConfig) -> bool {
        !server.host.starts_with("unreachable")
    }

    async fn download(
        &self,
        server: &ServerConfig,
        remote_path: &str,
        local_path: &Path,
        on_progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let started = Instant::now();
        let Some(content) = self.file(&server.name, remote_path) else {
            return TransferResult::failed("No such file", 0, elapsed(started));
        };
        if let Err(done) = self.stream(&content, &on_progress, cancel).await {
            return TransferResult::failed("transfer cancelled", done, elapsed(started));
        }
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(local_path, &content).unwrap();
        TransferResult::ok(content.len() as u64, elapsed(started))
    }

    async fn upload(
        &self,
        server: &ServerConfig,
        local_path: &Path,
        remote_path: &str,
        on_progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> TransferResult {
        let started = Instant::now();
        let content = match std::fs::read(local_path) {
            Ok(content) => content,
            Err(e) => return TransferResult::failed(e.to_string(), 0, elapsed(started)),
        };
        if let Err(done) = self.stream(&content, &on_progress, cancel).await {
            return TransferResult::failed("transfer cancelled", done, elapsed(started));
        }
        self.put_file(&server.name, remote_path, &content);
        TransferResult::ok(content.len() as u64, elapsed(started))
    }
}
