//! kernel-pool daemon
//!
//! Thin front-end over the service core: newline-delimited JSON requests
//! on stdin, one JSON reply per line on stdout. EOF triggers coordinated
//! shutdown of every session and the reaper.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kernel_pool::config::Config;
use kernel_pool::kernel::StdioKernelLauncher;
use kernel_pool::service::{ExecuteRequest, Service};

#[derive(Parser, Debug)]
#[command(name = "kernel-pool")]
#[command(about = "Multi-user interactive code-execution session daemon")]
struct Args {
    /// Run in stdio mode (newline-delimited JSON requests)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// One request line on stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Execute(ExecuteRequest),
    Health,
    Sessions,
    Destroy { owner_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for replies)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    info!(
        kernel_exec = %config.kernel_exec,
        idle_timeout = ?config.idle_timeout,
        max_sessions_per_owner = config.max_sessions_per_owner,
        "Loaded configuration"
    );

    let launcher = Arc::new(StdioKernelLauncher::new(config.kernel_exec.clone()));
    let service = Service::new(config, launcher);

    if args.stdio {
        serve_stdio(service).await
    } else {
        anyhow::bail!("Only --stdio mode is currently supported")
    }
}

/// Serve requests from stdin until EOF, then shut the pool down.
async fn serve_stdio(service: Service) -> Result<()> {
    service.start().await;
    info!("Serving on stdio");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&service, &line).await;
        stdout.write_all(reply.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    service.shutdown().await;
    Ok(())
}

async fn handle_line(service: &Service, line: &str) -> serde_json::Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return json!({ "error": format!("invalid request: {e}") }),
    };

    match request {
        Request::Execute(req) => match service.execute(&req).await {
            Ok(result) => serde_json::to_value(&result)
                .unwrap_or_else(|e| json!({ "error": format!("serialization failed: {e}") })),
            Err(e) => json!({ "error": e.to_string(), "rejected": e.is_rejection() }),
        },
        Request::Health => {
            let health = service.health().await;
            json!({
                "status": health.status,
                "active_sessions": health.active_sessions,
                "version": health.version,
            })
        }
        Request::Sessions => match service.sessions().await {
            Some(snapshot) => json!({ "count": snapshot.len(), "sessions": snapshot }),
            None => json!({ "error": "not available" }),
        },
        Request::Destroy { owner_id } => {
            service.destroy_session(&owner_id).await;
            json!({ "ok": true })
        }
    }
}
