// ABOUTME: Entry point for the focuslog binary.
// ABOUTME: Parses CLI arguments, initializes tracing, opens the storage coordinator and prints JSON results.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use focuslog_core::{BackendKind, RecordKind, RecordQuery, TimeRange};
use focuslog_store::{StorageCoordinator, StoreConfig};
use serde_json::json;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the active backend, load state and last error.
    Status,
    /// List records, newest first.
    Query {
        /// How far back to look.
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        app: Option<String>,
        /// `activation` or `switch`.
        #[arg(long)]
        kind: Option<RecordKind>,
    },
    /// Per-application usage over a window.
    Usage {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Snapshot the active backend.
    Backup {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// List snapshots, newest first.
    Snapshots,
    /// Restore the active backend from its newest verified snapshot.
    Recover,
    /// Move every record to another backend.
    Migrate {
        /// `relational` or `file-store`.
        #[arg(long)]
        to: BackendKind,
    },
}

fn window(hours: i64) -> TimeRange {
    TimeRange::last(Duration::hours(hours.max(0)))
}

fn print(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Commands, coordinator: &StorageCoordinator) -> Result<()> {
    match command {
        Commands::Status => {
            let mut progress = coordinator.ensure_loaded().await;
            if let Err(err) = progress.complete().await {
                tracing::warn!("record load did not finish: {}", err);
            }
            print(&coordinator.health().await)
        }
        Commands::Query {
            hours,
            limit,
            app,
            kind,
        } => {
            let mut query = RecordQuery::in_range(window(hours));
            query.limit = limit;
            query.app_name = app;
            query.kind = kind;
            print(&coordinator.query(query).await?)
        }
        Commands::Usage { hours } => print(&coordinator.usage_aggregate(window(hours)).await?),
        Commands::Backup { reason } => {
            let snapshot = coordinator.backup_now(&reason).await?;
            print(&json!({
                "id": snapshot.id,
                "path": snapshot.path,
                "manifest": snapshot.manifest,
            }))
        }
        Commands::Snapshots => {
            let listing: Vec<_> = coordinator
                .snapshots()?
                .into_iter()
                .map(|snapshot| json!({ "id": snapshot.id, "manifest": snapshot.manifest }))
                .collect();
            print(&listing)
        }
        Commands::Recover => {
            let restored = coordinator.recover().await?;
            tracing::info!(snapshot = %restored.id, "recovered");
            print(&json!({ "restored": restored.id, "counts": restored.manifest.counts }))
        }
        Commands::Migrate { to } => {
            let handle = coordinator.start_migration(to).await?;
            let mut progress = coordinator.subscribe_migration();
            let watcher = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let current = progress.borrow_and_update().clone();
                    tracing::info!(
                        state = ?current.state,
                        fraction = current.fraction,
                        "{}",
                        current.step
                    );
                }
            });
            let outcome = handle.wait().await;
            watcher.abort();
            match outcome {
                Ok(report) => print(&report),
                Err(err) => {
                    if let focuslog_store::CoordinatorError::Migration(inner) = &err
                        && let Some(report) = inner.report()
                    {
                        print(report)?;
                    }
                    Err(err.into())
                }
            }
        }
    }
}

/// Resolves with the signal's name once the process is asked to stop. A
/// signal that cannot be installed is never reported.
async fn shutdown_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "interrupt",
            Err(err) => {
                tracing::warn!("cannot listen for ctrl-c: {}", err);
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                "terminate"
            }
            Err(err) => {
                tracing::warn!("cannot listen for SIGTERM: {}", err);
                std::future::pending().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "focuslog=info,focuslog_store=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = StoreConfig::from_env().context("loading configuration")?;
    let coordinator = StorageCoordinator::open(config)
        .await
        .context("opening storage")?;
    tracing::info!(started_at = %Utc::now(), "focuslog starting up");

    let outcome = tokio::select! {
        outcome = run(cli.command, &coordinator) => outcome,
        signal = shutdown_signal() => {
            tracing::warn!(signal, "stopping, checkpointing before exit");
            Err(anyhow::anyhow!("stopped by {}", signal))
        }
    };

    if let Err(err) = coordinator.checkpoint().await {
        tracing::error!("final checkpoint failed: {}", err);
    }
    outcome
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[tokio::test]
    async fn terminate_signal_stops_the_run() {
        let waiting = tokio::spawn(shutdown_signal());
        // Let the task install its handlers before the signal arrives.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let status = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let name = tokio::time::timeout(std::time::Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, "terminate");
    }
}
