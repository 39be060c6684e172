// ABOUTME: Progressive loader for the file store: recent window first, then older files in small batches.
// ABOUTME: Publishes LoadPhase transitions over a watch channel and yields between batches.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use super::FileState;
use crate::contract::LoadPhase;
use crate::worker::Worker;

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadSettings {
    pub batch_size: usize,
    pub recent_window: Duration,
}

/// A record file found by the directory listing. Files whose names do not
/// parse have no timestamp and are loaded last.
#[derive(Debug, Clone)]
pub(crate) struct ListedFile {
    pub timestamp: Option<DateTime<Utc>>,
    pub path: PathBuf,
}

#[derive(Debug)]
pub(crate) struct Listing {
    pub generation: u64,
    pub files: Vec<ListedFile>,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BatchOutcome {
    pub loaded: usize,
    pub skipped: usize,
}

enum Step {
    Done(BatchOutcome),
    Superseded,
    Failed,
}

async fn load_batch(
    worker: &Worker<FileState>,
    generation: u64,
    files: Vec<PathBuf>,
    now: DateTime<Utc>,
) -> Step {
    match worker
        .run(move |state| state.load_batch(generation, files, now))
        .await
    {
        Ok(Some(outcome)) => Step::Done(outcome),
        Ok(None) => Step::Superseded,
        Err(err) => {
            tracing::error!("record load aborted: {}", err);
            Step::Failed
        }
    }
}

pub(crate) async fn run(
    worker: Arc<Worker<FileState>>,
    settings: LoadSettings,
    tx: watch::Sender<LoadPhase>,
) {
    let started = Instant::now();
    let now = Utc::now();

    let listing = match worker.run(|state| state.list_record_files()).await {
        Ok(Ok(listing)) => listing,
        Ok(Err(err)) => {
            tracing::error!("failed to list record files: {}", err);
            tx.send_replace(LoadPhase::Failed);
            return;
        }
        Err(err) => {
            tracing::error!("failed to list record files: {}", err);
            tx.send_replace(LoadPhase::Failed);
            return;
        }
    };

    let cutoff = now - settings.recent_window;
    let (recent, mut older): (Vec<ListedFile>, Vec<ListedFile>) = listing
        .files
        .into_iter()
        .partition(|f| f.timestamp.is_some_and(|ts| ts >= cutoff));
    older.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let generation = listing.generation;
    let recent_paths = recent.into_iter().map(|f| f.path).collect();
    let first = match load_batch(&worker, generation, recent_paths, now).await {
        Step::Done(outcome) => outcome,
        Step::Superseded => {
            tx.send_replace(LoadPhase::Complete {
                initial: 0,
                loaded: 0,
                skipped: 0,
            });
            return;
        }
        Step::Failed => {
            tx.send_replace(LoadPhase::Failed);
            return;
        }
    };

    let initial = first.loaded;
    tx.send_replace(LoadPhase::InitialReady { initial });
    tracing::info!(
        initial,
        remaining = older.len(),
        "recent records ready in {:?}",
        started.elapsed()
    );

    let mut loaded = first.loaded;
    let mut skipped = first.skipped;
    let batch_size = settings.batch_size.max(1);
    for chunk in older.chunks(batch_size) {
        let paths = chunk.iter().map(|f| f.path.clone()).collect();
        match load_batch(&worker, generation, paths, now).await {
            Step::Done(outcome) => {
                loaded += outcome.loaded;
                skipped += outcome.skipped;
            }
            Step::Superseded => break,
            Step::Failed => {
                tx.send_replace(LoadPhase::Failed);
                return;
            }
        }
        tokio::task::yield_now().await;
    }

    tx.send_replace(LoadPhase::Complete {
        initial,
        loaded,
        skipped,
    });
    if skipped > 0 {
        tracing::warn!(loaded, skipped, "record load finished with unreadable files");
    } else {
        tracing::info!(loaded, "record load finished in {:?}", started.elapsed());
    }
}
