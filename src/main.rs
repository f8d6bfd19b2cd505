#![forbid(unsafe_code)]

//! `parachute-sandbox` binary.
//!
//! Loads configuration, opens the session database, reconciles workspace
//! containers with the runtime, then serves turns over stdin/stdout until
//! EOF or a shutdown signal. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use parachute_sandbox::config::GlobalConfig;
use parachute_sandbox::orchestrator::TurnOrchestrator;
use parachute_sandbox::persistence::db;
use parachute_sandbox::persistence::session_repo::SessionRepo;
use parachute_sandbox::runtime::docker::CliRuntime;
use parachute_sandbox::store::workspaces::ConfigWorkspaces;
use parachute_sandbox::store::{SessionStore, WorkspaceStore};
use parachute_sandbox::transport;
use parachute_sandbox::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "parachute-sandbox", about = "Sandbox execution engine for agent turns", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("parachute-sandbox bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(
        data_dir = %config.data_dir.display(),
        workspaces = config.workspaces.len(),
        "configuration loaded"
    );

    // ── Initialize database ─────────────────────────────
    let pool = Arc::new(db::connect(&config.db_path()).await?);
    info!("database connected");

    let sessions: Arc<dyn SessionStore> = Arc::new(SessionRepo::new(pool));
    let workspaces: Arc<dyn WorkspaceStore> =
        Arc::new(ConfigWorkspaces::new(config.workspaces.clone()));
    let runtime = Arc::new(CliRuntime::new(config.container.runtime_bin.clone()));

    let orchestrator = Arc::new(TurnOrchestrator::new(
        &config,
        runtime,
        Arc::clone(&sessions),
        workspaces,
    ));

    // ── Reconcile and start background tasks ────────────
    let background = orchestrator.start().await;
    info!(tasks = background.len(), "background tasks started");

    // ── Serve ───────────────────────────────────────────
    let ct = CancellationToken::new();
    let serve_ct = ct.clone();
    let serve_orchestrator = Arc::clone(&orchestrator);
    let mut serve_handle = tokio::spawn(async move {
        if let Err(err) = transport::serve_stdio(serve_orchestrator, sessions, serve_ct).await {
            error!(%err, "stdio front end failed");
        }
    });

    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            ct.cancel();
            let _ = (&mut serve_handle).await;
        }
        _ = &mut serve_handle => {
            info!("input closed");
        }
    }

    // ── Graceful shutdown ───────────────────────────────
    orchestrator.shutdown().await;
    for handle in background {
        let _ = handle.await;
    }
    info!("parachute-sandbox shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the protocol; logs must stay on stderr.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
