#![forbid(unsafe_code)]

//! `agent-dialogue`: operator CLI for the checkpoint and trace store.
//!
//! Applies the schema, inspects threads, replays trace bundles, and runs
//! the retention service.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_dialogue::config::GlobalConfig;
use agent_dialogue::models::message::Message;
use agent_dialogue::observability::projection::TraceProjector;
use agent_dialogue::persistence::checkpoint_repo::CheckpointRepo;
use agent_dialogue::persistence::trace_repo::TraceRepo;
use agent_dialogue::persistence::{db, retention};
use agent_dialogue::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "agent-dialogue",
    about = "Agent checkpoint and trace store",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or upgrade the database schema.
    Migrate,
    /// Print the latest checkpoint of a thread as JSON.
    ShowThread {
        /// Owning tenant.
        #[arg(long)]
        tenant: String,
        /// Thread identifier.
        #[arg(long)]
        thread: String,
    },
    /// Project the trace bundle of a stored assistant message file.
    Ingest {
        /// Owning tenant.
        #[arg(long)]
        tenant: String,
        /// JSON file holding one assistant message.
        #[arg(long)]
        file: PathBuf,
    },
    /// Run one retention pass and exit.
    Purge,
    /// Run the retention service until interrupted.
    Run,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(db_path = %config.db_path.display(), "database connected");

    match args.command {
        Command::Migrate => {
            info!("schema applied");
        }
        Command::ShowThread { tenant, thread } => {
            let repo = CheckpointRepo::new(Arc::clone(&db));
            let checkpoint = repo
                .latest(&tenant, &thread)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("thread {thread} has no checkpoint")))?;
            println!("{}", checkpoint.to_json()?);
        }
        Command::Ingest { tenant, file } => {
            let raw = std::fs::read_to_string(&file)
                .map_err(|err| AppError::Io(format!("cannot read {}: {err}", file.display())))?;
            let message: Message = serde_json::from_str(&raw)
                .map_err(|err| AppError::Config(format!("invalid message file: {err}")))?;
            let projector =
                TraceProjector::new(TraceRepo::new(Arc::clone(&db)), config.retry.clone());
            match projector.ingest_with_retry(&tenant, &message).await? {
                Some(trace_ref_id) => println!("{trace_ref_id}"),
                None => info!(message_id = %message.id(), "message carries no trace bundle"),
            }
        }
        Command::Purge => {
            let report = retention::purge(&db, config.retention_days).await?;
            println!(
                "purged {} checkpoint(s), {} trace(s)",
                report.checkpoints, report.traces
            );
        }
        Command::Run => {
            let ct = CancellationToken::new();
            let handle =
                retention::spawn_retention_task(Arc::clone(&db), config.retention_days, ct.clone());
            info!(retention_days = config.retention_days, "retention service started");

            shutdown_signal().await;
            info!("shutdown signal received");
            ct.cancel();
            let _ = handle.await;
        }
    }

    db.close().await;
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
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
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

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
