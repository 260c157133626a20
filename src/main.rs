use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use litesentry::core::{
    Job, JobKind, ServerRegistry, SshTransport, Transport, TransportOptions,
};
use litesentry::rpc::{RpcClient, RpcServer};
use litesentry::{config, context, db, logging};
use serde::Serialize;
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(name = "litesentry")]
#[command(about = "Discover, back up and inspect SQLite databases on remote servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: /etc/litesentry/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Daemon RPC address for client commands
    #[arg(long, global = true)]
    rpc: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job queue and RPC listener
    Daemon(DaemonArgs),
    /// Show daemon status
    Status,
    /// List recent jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one job
    Job { id: String },
    /// Cancel a queued or running job
    Cancel { id: String },
    /// Find database files on a server
    Discover {
        server: String,
        /// Directory to scan instead of /
        #[arg(long)]
        root: Option<String>,
    },
    /// Back up a remote database file
    Backup { server: String, remote_path: String },
    /// Check that a server is reachable with its configured credentials
    Test { server: String },
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backup_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_jobs: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let config = match &cli.command {
        Commands::Daemon(args) => config::AppConfig::new(config_path, Some(args))?,
        _ => config::AppConfig::new(config_path, None::<&DaemonArgs>)?,
    };

    logging::init(logging::LogConfig {
        json: config.log_json,
        verbose: config.verbose,
    });

    let client = || RpcClient::new(cli.rpc.unwrap_or(config.rpc_bind));

    match &cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed")?,
        Commands::Status => {
            let status = client().status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Jobs { limit } => {
            for job in client().list_jobs(Some(*limit)).await? {
                print_job_line(&job);
            }
        }
        Commands::Job { id } => {
            let job = client().get_job(id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Cancel { id } => {
            if client().cancel_job(id).await? {
                println!("Cancelled {}", id);
            } else {
                bail!("Job {} is not active", id);
            }
        }
        Commands::Discover { server, root } => {
            let payload = json!({ "server": server, "search_root": root });
            let id = client().enqueue(JobKind::Discovery, payload).await?;
            println!("Enqueued discovery job {}", id);
        }
        Commands::Backup {
            server,
            remote_path,
        } => {
            let payload = json!({ "server": server, "remote_path": remote_path });
            let id = client().enqueue(JobKind::Backup, payload).await?;
            println!("Enqueued backup job {}", id);
        }
        Commands::Test { server } => run_test(&config, server).await?,
    }

    Ok(())
}

async fn run_daemon(config: config::AppConfig) -> Result<()> {
    let store = db::SqliteJobStore::open(&config.database_path).await?;
    let ctx = context::AppContext::new(config, Arc::new(store));
    info!(
        servers = ctx.servers.names().len(),
        workers = ctx.config.max_concurrent_jobs,
        "litesentry daemon starting"
    );

    let server = Arc::new(RpcServer::new(ctx.clone(), ctx.config.rpc_bind));
    let mut rpc = tokio::spawn({
        let server = server.clone();
        async move { server.start().await }
    });

    tokio::select! {
        res = &mut rpc => {
            ctx.queue.shutdown().await;
            res.context("RPC task panicked")??;
            bail!("RPC server stopped unexpectedly");
        }
        sig = tokio::signal::ctrl_c() => sig.context("Failed to listen for Ctrl-C")?,
    }

    info!("Shutdown requested");
    server.shutdown();
    ctx.queue.shutdown().await;
    rpc.await.context("RPC task panicked")??;
    info!("litesentry daemon stopped");
    Ok(())
}

async fn run_test(config: &config::AppConfig, name: &str) -> Result<()> {
    let servers = ServerRegistry::new(config.servers.clone());
    let server = servers.get(name)?;
    let transport = SshTransport::new(TransportOptions::from(config));

    let reachable = transport.test_connection(server).await;
    transport.close().await;
    if !reachable {
        bail!("{} ({}) is not reachable", server.name, server.address());
    }
    println!("{} ({}) OK", server.name, server.address());
    Ok(())
}

fn print_job_line(job: &Job) {
    println!(
        "{}  {:<9}  {:<9}  {:>3}%  {}  {}",
        job.id,
        job.kind.as_str(),
        job.status.as_str(),
        job.progress,
        job.start_time().format("%Y-%m-%d %H:%M:%S"),
        job.error.as_deref().unwrap_or(&job.name)
    );
}
