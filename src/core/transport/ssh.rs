//! `Transport` over SSH (command channel) and SFTP (file transfer), built on
//! `ssh2`. libssh2 calls are blocking, so every network operation runs on the
//! blocking thread pool and the async side only waits for it.

use std::fs::File;
use std::future::Future;
use std::io::{BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ssh2::Session;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::pool::SessionPool;
use super::stream::{self, StreamFailure};
use super::{CommandResult, ProgressFn, Transport, elapsed_ms};
use crate::config::AppConfig;
use crate::core::{Credentials, PoolKey, ServerConfig, TransferResult};
use crate::error::TransportError;
use crate::logging::mask_secrets;

/// Interval between checks while waiting for a remote command.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Keepalive interval requested from the server, in seconds.
const KEEPALIVE_SECS: u32 = 30;

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    /// Extra connect attempts after the first one fails transiently.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub mask_secrets: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for TransportOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            connect_timeout: config.connect_timeout(),
            retry_attempts: config.ssh_retry_attempts,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            mask_secrets: config.mask_secrets,
        }
    }
}

/// Pools one command session and one transfer session per server identity.
pub struct SshTransport {
    options: TransportOptions,
    commands: SessionPool<Session>,
    transfers: SessionPool<Session>,
}

impl SshTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            commands: SessionPool::new(),
            transfers: SessionPool::new(),
        }
    }

    /// Disconnect and release every pooled session.
    pub async fn close(&self) {
        let sessions: Vec<Session> = self
            .commands
            .drain()
            .into_iter()
            .chain(self.transfers.drain())
            .collect();
        if sessions.is_empty() {
            return;
        }
        let count = sessions.len();
        let _ = tokio::task::spawn_blocking(move || {
            for session in sessions {
                let _ = session.disconnect(None, "litesentry shutting down", None);
            }
        })
        .await;
        info!(sessions = count, "Released pooled SSH sessions");
    }

    async fn command_session(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Session, TransportError> {
        self.pooled(&self.commands, server, cancel).await
    }

    async fn transfer_session(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Session, TransportError> {
        self.pooled(&self.transfers, server, cancel).await
    }

    /// Pooled session for `server`. The liveness check on a pooled session
    /// shares libssh2's session lock with any command still reading from it,
    /// so acquisition as a whole is bounded by `command_timeout` and `cancel`.
    async fn pooled(
        &self,
        pool: &SessionPool<Session>,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Session, TransportError> {
        // Configuration faults surface before any network attempt
        server.credentials()?;

        let key = server.pool_key();
        acquire_within(
            pool.get_or_connect(&key, is_alive, || self.connect(server, cancel)),
            cancel,
            self.options.command_timeout,
        )
        .await
    }

    /// Open a session, retrying transient connect/handshake failures with
    /// linear backoff.
    async fn connect(
        &self,
        server: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Session, TransportError> {
        let mut attempt: u32 = 0;
        loop {
            let server_owned = server.clone();
            let options = self.options.clone();
            let result = tokio::task::spawn_blocking(move || open_session(&server_owned, &options))
                .await
                .map_err(|e| TransportError::Join(e.to_string()))?;

            match result {
                Ok(session) => {
                    info!(pool_key = %server.pool_key(), attempt, "SSH session established");
                    return Ok(session);
                }
                Err(e) if e.is_transient() && attempt < self.options.retry_attempts => {
                    attempt += 1;
                    let backoff = self.options.retry_backoff * attempt;
                    warn!(
                        pool_key = %server.pool_key(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "SSH connect failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn mask(&self, server: &ServerConfig, text: &str) -> String {
        if self.options.mask_secrets {
            mask_secrets(text, &server.secrets())
        } else {
            text.to_string()
        }
    }

    fn evict_command(&self, key: &PoolKey) {
        self.commands.evict(key);
    }

    fn evict_transfer(&self, key: &PoolKey) {
        self.transfers.evict(key);
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        // Dropping the sessions frees the libssh2 handles and sockets
        let released = self.commands.drain().len() + self.transfers.drain().len();
        if released > 0 {
            debug!(sessions = released, "Dropped pooled SSH sessions");
        }
    }
}

/// Race a session acquisition against cancellation and a deadline. The
/// blocking work behind `acquire` keeps running on its thread; only the wait
/// for it stops.
async fn acquire_within<T>(
    acquire: impl Future<Output = Result<T, TransportError>>,
    cancel: &CancellationToken,
    deadline: Duration,
) -> Result<T, TransportError> {
    tokio::select! {
        acquired = acquire => acquired,
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        _ = tokio::time::sleep(deadline) => Err(TransportError::SessionTimeout(deadline.as_secs())),
    }
}

async fn is_alive(session: Session) -> bool {
    tokio::task::spawn_blocking(move || {
        session.authenticated() && session.keepalive_send().is_ok()
    })
    .await
    .unwrap_or(false)
}

fn open_session(server: &ServerConfig, options: &TransportOptions) -> Result<Session, TransportError> {
    let addr = server.address();
    let socket = addr
        .to_socket_addrs()
        .map_err(|source| TransportError::Connect {
            addr: addr.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| TransportError::Connect {
            addr: addr.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
        })?;

    let tcp = TcpStream::connect_timeout(&socket, options.connect_timeout).map_err(|source| {
        TransportError::Connect {
            addr: addr.clone(),
            source,
        }
    })?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(millis_u32(options.connect_timeout));
    session
        .handshake()
        .map_err(|source| TransportError::Handshake {
            addr: addr.clone(),
            source,
        })?;

    authenticate(&session, server)?;

    session.set_keepalive(true, KEEPALIVE_SECS);
    session.set_timeout(millis_u32(options.command_timeout));
    Ok(session)
}

fn authenticate(session: &Session, server: &ServerConfig) -> Result<(), TransportError> {
    let user = server.username.as_str();
    let result = match server.credentials()? {
        Credentials::Password(password) => session.userauth_password(user, password),
        Credentials::KeyData { key, passphrase } => {
            session.userauth_pubkey_memory(user, None, key, passphrase)
        }
        Credentials::KeyFile { path, passphrase } => {
            session.userauth_pubkey_file(user, None, path, passphrase)
        }
    };

    let auth_error = |reason: String| TransportError::Auth {
        user: user.to_string(),
        addr: server.address(),
        reason,
    };

    result.map_err(|e| auth_error(e.message().to_string()))?;
    if !session.authenticated() {
        return Err(auth_error("server did not accept credentials".into()));
    }
    Ok(())
}

fn millis_u32(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

fn run_command_blocking(session: &Session, command: &str) -> Result<CommandOutput, TransportError> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut stdout = Vec::new();
    channel.read_to_end(&mut stdout)?;
    let mut stderr = Vec::new();
    channel.stderr().read_to_end(&mut stderr)?;

    channel.wait_close()?;
    let exit_code = channel.exit_status()?;

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

enum Waited<T> {
    Done(T),
    Cancelled,
    TimedOut,
}

/// Poll a blocking task at `POLL_INTERVAL`, checking cancellation and the
/// deadline between polls.
async fn wait_blocking<T>(
    mut handle: JoinHandle<T>,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<Waited<T>, TransportError> {
    let started = Instant::now();
    loop {
        tokio::select! {
            joined = &mut handle => {
                return joined
                    .map(Waited::Done)
                    .map_err(|e| TransportError::Join(e.to_string()));
            }
            _ = cancel.cancelled() => return Ok(Waited::Cancelled),
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if started.elapsed() >= timeout {
                    return Ok(Waited::TimedOut);
                }
            }
        }
    }
}

fn transfer_failure(failure: StreamFailure) -> (String, bool) {
    match failure {
        StreamFailure::Cancelled => ("transfer cancelled".to_string(), false),
        other => (other.to_string(), true),
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn execute_command(
        &self,
        server: &ServerConfig,
        command: &str,
        cancel: &CancellationToken,
    ) -> CommandResult {
        let started = Instant::now();
        let key = server.pool_key();
        let span = info_span!("remote_command", server = %server.name, pool_key = %key);

        async {
            let session = match self.command_session(server, cancel).await {
                Ok(session) => session,
                Err(TransportError::Cancelled) => {
                    debug!("Cancelled while waiting for an SSH session");
                    return CommandResult::failure(
                        TransportError::Cancelled.to_string(),
                        elapsed_ms(started),
                    );
                }
                Err(e) => {
                    let message = self.mask(server, &e.to_string());
                    warn!(error = %message, "Failed to obtain SSH session");
                    return CommandResult::failure(message, elapsed_ms(started));
                }
            };

            let owned_command = command.to_string();
            let handle =
                tokio::task::spawn_blocking(move || run_command_blocking(&session, &owned_command));

            match wait_blocking(handle, cancel, self.options.command_timeout).await {
                Ok(Waited::Done(Ok(output))) => {
                    let success = output.exit_code == 0;
                    debug!(exit_code = output.exit_code, "Remote command finished");
                    CommandResult {
                        success,
                        stdout: output.stdout,
                        stderr: self.mask(server, &output.stderr),
                        exit_code: Some(output.exit_code),
                        duration_ms: elapsed_ms(started),
                        error: None,
                    }
                }
                Ok(Waited::Done(Err(e))) | Err(e) => {
                    // The session is presumed broken after any transport fault
                    self.evict_command(&key);
                    let message = self.mask(server, &e.to_string());
                    warn!(error = %message, "Remote command failed");
                    CommandResult::failure(message, elapsed_ms(started))
                }
                Ok(Waited::Cancelled) => {
                    debug!("Stopped waiting for remote command after cancellation");
                    CommandResult::failure(
                        TransportError::Cancelled.to_string(),
                        elapsed_ms(started),
                    )
                }
                Ok(Waited::TimedOut) => {
                    self.evict_command(&key);
                    let e = TransportError::Timeout(self.options.command_timeout.as_secs());
                    warn!(error = %e, "Remote command timed out");
                    CommandResult::failure(e.to_string(), elapsed_ms(started))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn test_connection(&self, server: &ServerConfig) -> bool {
        let result = self
            .execute_command(server, "true", &CancellationToken::new())
            .await;
        result.success
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
        let key = server.pool_key();
        let span = info_span!(
            "download",
            server = %server.name,
            remote_path = %remote_path,
            local_path = %local_path.display()
        );

        async {
            if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return TransferResult::failed(
                        format!("failed to create {}: {}", parent.display(), e),
                        0,
                        elapsed_ms(started),
                    );
                }
            }

            let session = match self.transfer_session(server, cancel).await {
                Ok(session) => session,
                Err(e) => {
                    return TransferResult::failed(
                        self.mask(server, &e.to_string()),
                        0,
                        elapsed_ms(started),
                    );
                }
            };

            let remote = remote_path.to_string();
            let local = local_path.to_path_buf();
            let token = cancel.clone();
            let joined = tokio::task::spawn_blocking(move || -> Result<u64, (String, bool)> {
                let sftp = session.sftp().map_err(|e| (e.to_string(), true))?;
                let remote_stat = sftp.stat(Path::new(&remote)).ok();
                let total = remote_stat.as_ref().and_then(|s| s.size);
                let mut file = sftp
                    .open(Path::new(&remote))
                    .map_err(|e| (format!("failed to open {}: {}", remote, e), false))?;

                let bytes =
                    stream::copy_to_file(&mut file, &local, total, on_progress.as_ref(), &token)
                        .map_err(transfer_failure)?;

                if let Some(mtime) = remote_stat.and_then(|s| s.mtime) {
                    let ft = filetime::FileTime::from_unix_time(mtime as i64, 0);
                    if let Err(e) = filetime::set_file_mtime(&local, ft) {
                        debug!(error = %e, "Failed to preserve remote modification time");
                    }
                }
                Ok(bytes)
            })
            .await;

            match joined {
                Ok(Ok(bytes)) => {
                    info!(bytes, "Download complete");
                    TransferResult::ok(bytes, elapsed_ms(started))
                }
                Ok(Err((message, evict))) => {
                    if evict {
                        self.evict_transfer(&key);
                    }
                    warn!(error = %message, "Download failed");
                    TransferResult::failed(message, 0, elapsed_ms(started))
                }
                Err(e) => {
                    stream::remove_partial(local_path);
                    TransferResult::failed(e.to_string(), 0, elapsed_ms(started))
                }
            }
        }
        .instrument(span)
        .await
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
        let key = server.pool_key();
        let span = info_span!(
            "upload",
            server = %server.name,
            local_path = %local_path.display(),
            remote_path = %remote_path
        );

        async {
            let total = match tokio::fs::metadata(local_path).await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => {
                    return TransferResult::failed(
                        format!("local file not found: {}", local_path.display()),
                        0,
                        elapsed_ms(started),
                    );
                }
            };

            let session = match self.transfer_session(server, cancel).await {
                Ok(session) => session,
                Err(e) => {
                    return TransferResult::failed(
                        self.mask(server, &e.to_string()),
                        0,
                        elapsed_ms(started),
                    );
                }
            };

            let remote = remote_path.to_string();
            let local = local_path.to_path_buf();
            let token = cancel.clone();
            let joined = tokio::task::spawn_blocking(move || -> Result<u64, (String, bool)> {
                let sftp = session.sftp().map_err(|e| (e.to_string(), true))?;
                let source = File::open(&local)
                    .map_err(|e| (format!("failed to open {}: {}", local.display(), e), false))?;
                let mut reader = BufReader::with_capacity(stream::CHUNK_SIZE, source);
                let mut remote_file = sftp
                    .create(Path::new(&remote))
                    .map_err(|e| (format!("failed to create {}: {}", remote, e), false))?;

                let result = stream::copy_stream(
                    &mut reader,
                    &mut remote_file,
                    Some(total),
                    on_progress.as_ref(),
                    &token,
                );
                if result.is_err() {
                    drop(remote_file);
                    let _ = sftp.unlink(Path::new(&remote));
                }
                result.map_err(transfer_failure)
            })
            .await;

            match joined {
                Ok(Ok(bytes)) => {
                    info!(bytes, "Upload complete");
                    TransferResult::ok(bytes, elapsed_ms(started))
                }
                Ok(Err((message, evict))) => {
                    if evict {
                        self.evict_transfer(&key);
                    }
                    warn!(error = %message, "Upload failed");
                    TransferResult::failed(message, 0, elapsed_ms(started))
                }
                Err(e) => TransferResult::failed(e.to_string(), 0, elapsed_ms(started)),
            }
        }
        .instrument(span)
        .await
    }
}
