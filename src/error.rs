//! Error types shared across the crate.

use thiserror::Error;

/// A configuration problem detected before any network activity.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server '{server}' uses {kind} authentication but no {missing} is configured")]
    MissingSecret {
        server: String,
        kind: &'static str,
        missing: &'static str,
    },

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failures inside the SSH transport. These never cross the transport
/// boundary as errors; they are folded into `CommandResult`/`TransferResult`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: ssh2::Error,
    },

    #[error("authentication failed for {user}@{addr}: {reason}")]
    Auth {
        user: String,
        addr: String,
        reason: String,
    },

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command timed out after {0}s")]
    Timeout(u64),

    #[error("timed out after {0}s waiting for an SSH session")]
    SessionTimeout(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("background task failed: {0}")]
    Join(String),
}

impl TransportError {
    /// Errors that are worth a reconnect attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Handshake { .. })
    }
}

/// Outcome of a job handler that did not complete normally.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job was cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl JobError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{}", message))
    }
}

/// Errors returned by `JobQueue::enqueue`.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is shutting down")]
    ShuttingDown,

    #[error("no handler registered for job kind {0}")]
    NoHandler(crate::core::JobKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_connect_and_handshake_only() {
        let connect = TransportError::Connect {
            addr: "h:22".into(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(connect.is_transient());

        let auth = TransportError::Auth {
            user: "u".into(),
            addr: "h:22".into(),
            reason: "denied".into(),
        };
        assert!(!auth.is_transient());
        assert!(!TransportError::Timeout(5).is_transient());
    }

    #[test]
    fn missing_secret_message_names_server_and_material() {
        let err = ConfigError::MissingSecret {
            server: "prod".into(),
            kind: "password",
            missing: "password",
        };
        let msg = err.to_string();
        assert!(msg.contains("prod"));
        assert!(msg.contains("no password"));
    }
}
