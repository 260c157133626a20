//! TCP listener for the RPC server.
//!
//! Newline-delimited JSON framing, one task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{Instrument, debug, debug_span, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

/// Requests larger than this are rejected without being parsed.
const MAX_REQUEST_BYTES: usize = 1024 * 1024;

pub struct Listener {
    bind_addr: SocketAddr,
    handler: Arc<MethodHandler>,
}

impl Listener {
    pub fn new(bind_addr: SocketAddr, handler: MethodHandler) -> Self {
        Self {
            bind_addr,
            handler: Arc::new(handler),
        }
    }

    /// Accept connections until a shutdown signal is received.
    pub async fn listen(&self, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "RPC server listening");
        serve(listener, self.handler.clone(), shutdown).await;
        Ok(())
    }
}

pub(super) async fn serve(
    listener: TcpListener,
    handler: Arc<MethodHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    tokio::spawn(
                        async move {
                            debug!("Client connected");
                            if let Err(e) = handle_connection(stream, handler).await {
                                debug!(error = %e, "Connection error");
                            }
                            debug!("Client disconnected");
                        }
                        .instrument(debug_span!("rpc_conn", %peer)),
                    );
                }
                Err(e) => error!(error = %e, "Failed to accept connection"),
            },
            _ = shutdown.recv() => {
                info!("RPC server shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<MethodHandler>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }

        let response = if line.len() > MAX_REQUEST_BYTES {
            warn!(bytes = line.len(), "Request too large");
            Some(Response::invalid_request(serde_json::Value::Null))
        } else {
            handle_line(&handler, line.trim()).await
        };

        if let Some(response) = response {
            let mut json = serde_json::to_string(&response)?;
            json.push('\n');
            writer.write_all(json.as_bytes()).await?;
        }
    }

    Ok(())
}

/// Decode and dispatch one framed request. Notifications and blank lines
/// produce no response.
pub(super) async fn handle_line(handler: &MethodHandler, line: &str) -> Option<Response> {
    if line.is_empty() {
        return None;
    }

    let request = match serde_json::from_str::<Request>(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Parse error");
            return Some(Response::parse_error());
        }
    };

    if let Err(msg) = request.validate() {
        warn!(error = msg, "Invalid request");
        let id = request.id.clone().unwrap_or(serde_json::Value::Null);
        return Some(Response::invalid_request(id));
    }

    if request.is_notification() {
        debug!(method = %request.method, "Notification received");
        handler.handle(request).await;
        return None;
    }

    Some(handler.handle(request).await)
}
