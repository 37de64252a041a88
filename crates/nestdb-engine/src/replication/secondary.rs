//! Secondary replica agent.
//!
//! Tails a primary's replication stream and applies commands to the local
//! database. Progress (next byte offset per collection) persists across
//! restarts; commands at already-applied offsets are skipped. When a
//! command cannot apply because local state diverged, the collection is
//! deleted and rebuilt from scratch on the next pass.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nestdb_common::{NestError, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::collection::Command;
use crate::database::{Database, Status};

use super::bus::Event;
use super::stream::EventStream;

/// Progress bookkeeping file, kept next to the collection logs.
pub const PROGRESS_FILE: &str = ".replication-progress.json";

const NOT_OPERATING_RETRY: Duration = Duration::from_millis(500);
const STREAM_RETRY: Duration = Duration::from_secs(1);

pub struct Secondary {
    inner: Arc<SecondaryInner>,
    shutdown: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct SecondaryInner {
    db: Arc<Database>,
    primary_url: String,
    progress: Mutex<HashMap<String, i64>>,
    progress_file: PathBuf,
}

impl Secondary {
    pub fn new(db: Arc<Database>, primary_url: impl Into<String>) -> Self {
        let progress_file = db.dir().join(PROGRESS_FILE);
        let inner = Arc::new(SecondaryInner {
            db,
            primary_url: primary_url.into(),
            progress: Mutex::new(HashMap::new()),
            progress_file,
        });
        inner.load_progress();
        Self {
            inner,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the replication loop. Requires a tokio runtime.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            run_loop(inner, shutdown).await;
        });
        *self.task.lock() = Some(handle);
    }

    /// Cancel the in-flight stream and wait for the loop to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Apply one replication event: resolve (or create) the collection,
    /// skip already-applied offsets, persist locally, record progress.
    pub fn apply_event(&self, event: &Event) -> Result<()> {
        self.inner.apply_event(event)
    }

    /// Next byte offset to apply for a collection.
    pub fn progress(&self, collection: &str) -> i64 {
        self.inner.last_applied(collection)
    }
}

async fn run_loop(inner: Arc<SecondaryInner>, shutdown: CancellationToken) {
    loop {
        if inner.db.status() != Status::Operating {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(NOT_OPERATING_RETRY) => continue,
            }
        }

        if let Err(err) = run_once(&inner, &shutdown).await {
            tracing::warn!(primary = %inner.primary_url, error = %err, "replication error");
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(STREAM_RETRY) => {}
        }
    }
}

async fn run_once(inner: &Arc<SecondaryInner>, shutdown: &CancellationToken) -> Result<()> {
    let since = inner.snapshot_positions();
    let mut stream = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        opened = EventStream::open(&inner.primary_url, &since) => opened?,
    };

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = stream.next_event() => event?,
        };
        match event {
            Some(event) => inner.apply_event(&event)?,
            None => return Ok(()),
        }
    }
}

impl SecondaryInner {
    fn apply_event(&self, event: &Event) -> Result<()> {
        if event.collection.is_empty() {
            return Err(NestError::MalformedJson(
                "replication event missing collection name".into(),
            ));
        }

        let command: Command = serde_json::from_str(event.command.get())?;

        let collection = match self.db.get_collection(&event.collection) {
            Ok(collection) => collection,
            Err(_) => self.db.create_collection(&event.collection)?,
        };

        if self.last_applied(&event.collection) > command.start_byte {
            return Ok(());
        }

        match collection.apply_command(&command, true) {
            Ok(()) => {
                self.record_progress(&event.collection, command.start_byte + 1);
                Ok(())
            }
            Err(err) if err.is_divergence() => {
                tracing::warn!(
                    collection = %event.collection,
                    error = %err,
                    "replication diverged, resetting collection"
                );
                self.resync(&event.collection);
                Err(NestError::Unavailable(format!(
                    "collection '{}' reset for resync: {err}",
                    event.collection
                )))
            }
            Err(err) => Err(err),
        }
    }

    /// Delete the local collection and forget its progress so the next
    /// pass rebuilds it from the primary's history.
    fn resync(&self, name: &str) {
        if let Err(err) = self.db.drop_collection(name) {
            tracing::warn!(collection = %name, error = %err, "reset collection failed");
        }

        let mut progress = self.progress.lock();
        progress.remove(name);
        self.save_progress_locked(&progress);
    }

    fn last_applied(&self, name: &str) -> i64 {
        self.progress.lock().get(name).copied().unwrap_or(0)
    }

    fn record_progress(&self, name: &str, position: i64) {
        if position <= 0 {
            return;
        }
        let mut progress = self.progress.lock();
        let current = progress.get(name).copied().unwrap_or(0);
        if position > current {
            progress.insert(name.to_string(), position);
            self.save_progress_locked(&progress);
        }
    }

    fn snapshot_positions(&self) -> HashMap<String, i64> {
        self.progress
            .lock()
            .iter()
            .filter(|(_, position)| **position > 0)
            .map(|(name, position)| (name.clone(), *position))
            .collect()
    }

    fn load_progress(&self) {
        let data = match std::fs::read(&self.progress_file) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!(error = %err, "load replication progress failed");
                return;
            }
        };
        match serde_json::from_slice::<HashMap<String, i64>>(&data) {
            Ok(entries) => {
                let mut progress = self.progress.lock();
                for (name, position) in entries {
                    if position > 0 {
                        progress.insert(name, position);
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "decode replication progress failed"),
        }
    }

    /// Write-to-tmp + rename so a crash never leaves a torn file.
    fn save_progress_locked(&self, progress: &HashMap<String, i64>) {
        let data = match serde_json::to_vec(progress) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(error = %err, "encode replication progress failed");
                return;
            }
        };
        let tmp = self.progress_file.with_extension("json.tmp");
        if let Err(err) = std::fs::write(&tmp, &data) {
            tracing::warn!(error = %err, "persist replication progress failed");
            return;
        }
        if let Err(err) = std::fs::rename(&tmp, &self.progress_file) {
            tracing::warn!(error = %err, "finalize replication progress failed");
        }
    }
}
