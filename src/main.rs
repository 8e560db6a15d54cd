// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `firehose-mirror` daemon.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use firehose_mirror::logging::init_tracing;
use firehose_mirror::{Mirror, SyncConfig, SyncEngine, WebSocketTransport};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "firehose-mirror", version, about = "Mirror a Jetstream firehose into SQLite")]
struct Cli {
    /// TOML or JSON config file. `FIREHOSE_*` variables override it.
    #[arg(long, short, env = "FIREHOSE_CONFIG")]
    config: Option<PathBuf>,

    /// Subscribe endpoint (ws:// or wss://).
    #[arg(long)]
    endpoint: Option<String>,

    /// SQLite database path, or `:memory:`.
    #[arg(long)]
    database: Option<String>,

    /// Start from this time_us instead of the stored cursor.
    #[arg(long)]
    cursor: Option<i64>,

    /// Log filter directive, e.g. `debug` or `firehose_mirror=trace`.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut SyncConfig) {
        if let Some(endpoint) = self.endpoint {
            config.feed.endpoint = endpoint;
        }
        if let Some(database) = self.database {
            config.mirror.sqlite_path = database;
        }
        if let Some(cursor) = self.cursor {
            config.feed.start_cursor = Some(cursor);
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            // The subscriber may not be installed yet.
            eprintln!("firehose-mirror: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = SyncConfig::load(cli.config.as_deref()).context("loading config")?;
    cli.apply(&mut config);
    config.validate().context("invalid config")?;

    init_tracing(&config.log)?;
    info!(
        endpoint = %config.feed.endpoint,
        database = %config.mirror.sqlite_path,
        policy = %config.handling.on_write_failure,
        "firehose-mirror starting"
    );

    let mirror = Arc::new(
        Mirror::open_with(&config.mirror)
            .await
            .context("opening mirror database")?,
    );

    let mut engine = SyncEngine::new(config, Arc::clone(&mirror), Arc::new(WebSocketTransport));
    engine.start().await.context("starting sync engine")?;

    let outcome = tokio::select! {
        result = engine.wait_for_exit() => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    let cursor = engine.shutdown().await;
    mirror.close().await;
    info!(cursor = ?cursor, "firehose-mirror stopped");

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "Exiting after fatal error");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
