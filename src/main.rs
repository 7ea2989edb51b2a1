mod auth;
mod backup;
mod config;
mod db;
mod grading;
mod http;
mod ipc;
mod mailer;
mod sheets;
mod workflow;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "campusd")]
#[command(about = "Campus outing/outpass and academics service", long_about = None)]
#[command(version)]
struct Cli {
    /// Workspace directory holding campus.sqlite3
    #[arg(long, global = true, env = "CAMPUS_WORKSPACE")]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Line-delimited JSON requests on stdin, responses on stdout (default)
    Sidecar,

    /// HTTP API under /api/v1 with background sweep and mail dispatch
    Serve {
        /// Port to bind; overrides CAMPUS_PORT
        #[arg(long)]
        port: Option<u16>,
    },

    /// Expire overdue requests once and exit
    Sweep,
}

fn main() -> anyhow::Result<()> {
    // stdout carries the sidecar protocol.
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = config::Config::load().context("environment misconfigured")?;
    if let Some(ws) = &cli.workspace {
        config.workspace = ws.clone();
    }

    match cli.command.unwrap_or(Command::Sidecar) {
        Command::Sidecar => run_sidecar(cli.workspace, config.settings),
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(http::serve(config))
        }
        Command::Sweep => {
            let conn = db::open_db(&config.workspace).with_context(|| {
                format!("failed to open workspace {}", config.workspace.display())
            })?;
            let summary = workflow::sweep_expired(&conn, Utc::now())?;
            info!(
                outings = summary.outings_expired,
                outpasses = summary.outpasses_expired,
                "sweep finished"
            );
            Ok(())
        }
    }
}

fn run_sidecar(workspace: Option<PathBuf>, settings: ipc::Settings) -> anyhow::Result<()> {
    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        settings,
    };
    if let Some(ws) = workspace {
        let conn = db::open_db(&ws)
            .with_context(|| format!("failed to open workspace {}", ws.display()))?;
        info!(workspace = %ws.display(), "workspace opened");
        state.workspace = Some(ws);
        state.db = Some(conn);
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!("stdin closed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => ipc::unparsable(&e),
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    Ok(())
}
