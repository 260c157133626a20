//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls to the job queue, progress tracker and
//! server registry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

use crate::context::AppContext;
use crate::core::{AuthKind, Job, JobKind, JobStatus, ProgressEvent, QueueStats};

use super::protocol::{NOT_FOUND, QUEUE_REJECTED, Request, Response};

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    ctx: AppContext,
    start_time: Instant,
}

#[derive(Deserialize)]
struct JobIdParams {
    id: String,
}

#[derive(Deserialize)]
struct ServerParams {
    server: String,
}

fn parse_params<T: DeserializeOwned>(id: &Value, params: Value) -> Result<T, Response> {
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "daemon.status" => Ok(self.daemon_status(id)),
            "jobs.list" => self.jobs_list(id, params).await,
            "jobs.active" => Ok(self.jobs_active(id)),
            "jobs.get" => self.jobs_get(id, params).await,
            "jobs.cancel" => self.jobs_cancel(id, params).await,
            "jobs.enqueue" => self.jobs_enqueue(id, params).await,
            "progress.active" => Ok(self.progress_active(id).await),
            "progress.get" => self.progress_get(id, params).await,
            "servers.list" => Ok(self.servers_list(id)),
            "servers.test" => self.servers_test(id, params).await,
            _ => Ok(Response::method_not_found(id, &request.method)),
        };
        result.unwrap_or_else(|response| response)
    }

    /// Get daemon status/health information.
    fn daemon_status(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            queue: QueueStats,
            servers: usize,
            rpc_bind: String,
        }

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.start_time.elapsed().as_secs(),
                queue: self.ctx.queue.stats(),
                servers: self.ctx.servers.names().len(),
                rpc_bind: self.ctx.config.rpc_bind.to_string(),
            },
        )
    }

    /// Recent jobs, optionally filtered by status and capped.
    async fn jobs_list(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            limit: Option<usize>,
            #[serde(default)]
            status: Option<String>,
        }

        let params: Params = if params.is_null() {
            Params::default()
        } else {
            parse_params(&id, params)?
        };
        let status = params
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()
            .map_err(|e| Response::invalid_params(id.clone(), e))?;

        let mut jobs: Vec<Job> = self.ctx.queue.list_jobs().await;
        if let Some(status) = status {
            jobs.retain(|j| j.status == status);
        }
        if let Some(limit) = params.limit {
            jobs.truncate(limit);
        }
        Ok(Response::success(id, jobs))
    }

    fn jobs_active(&self, id: Value) -> Response {
        Response::success(id, self.ctx.queue.list_active_jobs())
    }

    async fn jobs_get(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: JobIdParams = parse_params(&id, params)?;
        Ok(match self.ctx.queue.get_job(&params.id).await {
            Some(job) => Response::success(id, job),
            None => Response::error(id, NOT_FOUND, format!("Job not found: {}", params.id)),
        })
    }

    async fn jobs_cancel(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Serialize)]
        struct Cancelled {
            id: String,
            cancelled: bool,
        }

        let params: JobIdParams = parse_params(&id, params)?;
        let cancelled = self.ctx.queue.cancel(&params.id).await;
        Ok(Response::success(
            id,
            Cancelled {
                id: params.id,
                cancelled,
            },
        ))
    }

    async fn jobs_enqueue(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize)]
        struct Params {
            kind: JobKind,
            #[serde(default)]
            name: Option<String>,
            #[serde(default)]
            payload: Value,
            #[serde(default)]
            correlation_id: Option<String>,
        }

        #[derive(Serialize)]
        struct Enqueued {
            id: String,
        }

        let params: Params = parse_params(&id, params)?;
        let name = params
            .name
            .unwrap_or_else(|| default_job_name(params.kind, &params.payload));

        match self
            .ctx
            .queue
            .enqueue_correlated(params.kind, name, params.payload, params.correlation_id)
            .await
        {
            Ok(job_id) => Ok(Response::success(id, Enqueued { id: job_id })),
            Err(e) => Ok(Response::error(id, QUEUE_REJECTED, e.to_string())),
        }
    }

    /// All active jobs with their latest progress.
    async fn progress_active(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct ActiveProgress {
            jobs: HashMap<String, ProgressEvent>,
            count: usize,
        }

        let jobs = self.ctx.progress.get_all().await;
        let count = jobs.len();
        Response::success(id, ActiveProgress { jobs, count })
    }

    async fn progress_get(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: JobIdParams = parse_params(&id, params)?;
        Ok(match self.ctx.progress.get(&params.id).await {
            Some(progress) => Response::success(id, progress),
            None => Response::error(
                id,
                NOT_FOUND,
                format!("Job not found or not active: {}", params.id),
            ),
        })
    }

    /// Configured servers, without secret material.
    fn servers_list(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct ServerSummary<'a> {
            name: &'a str,
            host: &'a str,
            port: u16,
            username: &'a str,
            auth: AuthKind,
            sudo_for_discovery: bool,
            allowed_roots: &'a [String],
        }

        let mut servers: Vec<ServerSummary<'_>> = self
            .ctx
            .servers
            .all()
            .map(|s| ServerSummary {
                name: &s.name,
                host: &s.host,
                port: s.port,
                username: &s.username,
                auth: s.auth,
                sudo_for_discovery: s.sudo_for_discovery,
                allowed_roots: &s.allowed_roots,
            })
            .collect();
        servers.sort_by(|a, b| a.name.cmp(b.name));
        Response::success(id, servers)
    }

    async fn servers_test(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Serialize)]
        struct TestResult {
            server: String,
            reachable: bool,
        }

        let params: ServerParams = parse_params(&id, params)?;
        let server = self
            .ctx
            .servers
            .get(&params.server)
            .map_err(|e| Response::error(id.clone(), NOT_FOUND, e.to_string()))?;
        let reachable = self.ctx.transport.test_connection(server).await;
        Ok(Response::success(
            id,
            TestResult {
                server: params.server,
                reachable,
            },
        ))
    }
}

/// "<kind> <server>:<path>" from whatever identifying fields the payload has.
fn default_job_name(kind: JobKind, payload: &Value) -> String {
    let field = |key: &str| payload.get(key).and_then(Value::as_str);
    let server = field("server").or_else(|| field("source_server"));
    let path = field("remote_path")
        .or_else(|| field("source_path"))
        .or_else(|| field("search_root"));
    match (server, path) {
        (Some(server), Some(path)) => format!("{} {}:{}", kind, server, path),
        (Some(server), None) => format!("{} {}", kind, server),
        _ => kind.to_string(),
    }
}
