//! RPC client for connecting to the daemon.

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{Request, Response, RpcError};
use crate::core::{Job, JobKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to daemon at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon closed the connection without replying")]
    NoResponse,

    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

/// RPC client for communicating with the daemon. One connection per call.
pub struct RpcClient {
    addr: SocketAddr,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Call an RPC method and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let connect = |source: std::io::Error| ClientError::Connect {
            addr: self.addr,
            source,
        };
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                connect(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })?
            .map_err(connect)?;

        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Some(Value::Number(1.into())),
        };
        let mut request_json = serde_json::to_string(&request)?;
        request_json.push('\n');

        let (reader, mut writer) = stream.into_split();
        writer.write_all(request_json.as_bytes()).await?;

        let mut reader = BufReader::new(reader);
        let mut response_line = String::new();
        if reader.read_line(&mut response_line).await? == 0 {
            return Err(ClientError::NoResponse);
        }

        let response: Response = serde_json::from_str(&response_line)?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }

    pub async fn status(&self) -> Result<Value, ClientError> {
        self.call("daemon.status", None).await
    }

    pub async fn list_jobs(&self, limit: Option<usize>) -> Result<Vec<Job>, ClientError> {
        self.call("jobs.list", Some(json!({ "limit": limit }))).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, ClientError> {
        self.call("jobs.get", Some(json!({ "id": id }))).await
    }

    /// Returns whether the daemon accepted the cancellation.
    pub async fn cancel_job(&self, id: &str) -> Result<bool, ClientError> {
        let reply: Value = self.call("jobs.cancel", Some(json!({ "id": id }))).await?;
        Ok(reply.get("cancelled").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Enqueue a job and return its id.
    pub async fn enqueue(&self, kind: JobKind, payload: Value) -> Result<String, ClientError> {
        let reply: Value = self
            .call("jobs.enqueue", Some(json!({ "kind": kind, "payload": payload })))
            .await?;
        match reply.get("id").and_then(Value::as_str) {
            Some(id) => Ok(id.to_string()),
            None => Err(ClientError::NoResponse),
        }
    }
}
