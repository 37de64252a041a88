//! NestDB Daemon Entry Point

use std::sync::Arc;

use nestdb_engine::{Database, Secondary};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::Config;

mod config;

fn get_env_filter() -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else if cfg!(debug_assertions) {
        EnvFilter::new("nestdb_engine=debug,nestd=debug")
    } else {
        EnvFilter::new("nestdb_engine=info,nestd=info")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("nestd.log")?;

    // Non-blocking log appenders
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(log_file);
    let (console_non_blocking, console_guard) = tracing_appender::non_blocking(std::io::stderr());
    // Maintain guard references to keep log threads alive
    let _guards = (file_guard, console_guard);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_non_blocking)
        .with_ansi(false)
        .with_target(true);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(console_non_blocking)
        .with_ansi(true)
        .with_target(false)
        .compact();

    Registry::default()
        .with(get_env_filter())
        .with(file_layer)
        .with(stderr_layer)
        .init();

    let config = Config::load_from_path("nestdb.toml")?;
    tracing::info!(
        dir = %config.storage.dir.display(),
        driver = %config.storage.driver,
        "NestDB {} starting",
        nestdb_engine::VERSION
    );

    let db = Arc::new(Database::new(config.storage.clone())?);

    // Recovery replays every collection log before the node serves.
    {
        let db = Arc::clone(&db);
        tokio::task::spawn_blocking(move || db.load()).await??;
    }

    let secondary = match &config.replication.primary {
        Some(primary) => {
            tracing::info!(primary = %primary, "running as secondary");
            let secondary = Secondary::new(Arc::clone(&db), primary.clone());
            secondary.start();
            Some(secondary)
        }
        None => None,
    };

    wait_for_shutdown_signal().await;

    if let Some(secondary) = secondary {
        secondary.stop().await;
    }
    let stop_db = Arc::clone(&db);
    tokio::task::spawn_blocking(move || stop_db.stop()).await??;

    tracing::info!("Shutdown completed");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal;

        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to wait for Ctrl+C: {e}");
        } else {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
    }
}
