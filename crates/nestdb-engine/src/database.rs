//! Collection registry and lifecycle.
//!
//! A database is a directory of collection log files. Startup replays
//! every file in parallel; the database only serves once all collections
//! recovered. Dropping a collection removes it from the map before closing
//! it, so in-flight readers always observe a consistent snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded};
use nestdb_common::{NestError, Result};
use parking_lot::{Mutex, RwLock};

use crate::collection::Collection;
use crate::config::DatabaseConfig;
use crate::persistence::{self, Driver};
use crate::replication::Bus;

/// Database lifecycle state. Transitions are linear: opening → operating
/// → closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Opening,
    Operating,
    Closing,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Opening => "opening",
            Status::Operating => "operating",
            Status::Closing => "closing",
        }
    }
}

pub struct Database {
    config: DatabaseConfig,
    driver: Arc<dyn Driver>,
    status: RwLock<Status>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    bus: Arc<Bus>,
    exit: Mutex<Option<crossbeam_channel::Sender<()>>>,
    exit_signal: crossbeam_channel::Receiver<()>,
}

impl Database {
    /// Create a database over a directory. No files are touched until
    /// [`Database::load`].
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let driver = persistence::registry().get(&config.driver)?;
        let (exit, exit_signal) = bounded(0);
        Ok(Self {
            config,
            driver,
            status: RwLock::new(Status::Opening),
            collections: RwLock::new(HashMap::new()),
            bus: Arc::new(Bus::new()),
            exit: Mutex::new(Some(exit)),
            exit_signal,
        })
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// The replication bus carrying every committed command.
    pub fn bus(&self) -> Arc<Bus> {
        Arc::clone(&self.bus)
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.config.dir.join(name)
    }

    /// Create and register a collection. Check-then-insert re-checks under
    /// the write lock so two racing creators cannot both win.
    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>> {
        if self.collections.read().contains_key(name) {
            return Err(NestError::CollectionExists(name.to_string()));
        }

        let collection = Arc::new(Collection::open(
            Arc::clone(&self.driver),
            self.collection_path(name),
            name,
            Some(self.bus()),
        )?);

        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            drop(collections);
            collection.close()?;
            return Err(NestError::CollectionExists(name.to_string()));
        }
        collections.insert(name.to_string(), Arc::clone(&collection));
        Ok(collection)
    }

    pub fn get_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NestError::CollectionNotFound(name.to_string()))
    }

    /// Snapshot of the registered collections.
    pub fn list_collections(&self) -> HashMap<String, Arc<Collection>> {
        self.collections.read().clone()
    }

    /// Unregister, close, then delete the collection file. Removal from
    /// the map comes first so readers never see a closed collection.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let collection = {
            let mut collections = self.collections.write();
            collections
                .remove(name)
                .ok_or_else(|| NestError::CollectionNotFound(name.to_string()))?
        };

        collection.close()?;
        self.driver.remove(collection.path())
    }

    /// Replay every collection file under the data directory, in parallel
    /// up to one worker per CPU. On any failure the first error wins,
    /// everything already opened is closed, and the database transitions
    /// straight to closing.
    pub fn load(&self) -> Result<()> {
        tracing::info!(dir = %self.config.dir.display(), "loading database");
        let started = Instant::now();

        std::fs::create_dir_all(&self.config.dir).map_err(NestError::read_failed)?;
        let files = collect_collection_files(&self.config.dir)?;

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(files.len().max(1));

        let (work_tx, work_rx) = unbounded::<(String, PathBuf)>();
        for entry in files {
            work_tx.send(entry).expect("queue collection file");
        }
        drop(work_tx);

        let first_error: Mutex<Option<NestError>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let first_error = &first_error;
                scope.spawn(move || {
                    for (name, path) in work_rx.iter() {
                        let t0 = Instant::now();
                        match Collection::open(
                            Arc::clone(&self.driver),
                            path,
                            name.clone(),
                            Some(self.bus()),
                        ) {
                            Ok(collection) => {
                                tracing::info!(
                                    collection = %name,
                                    rows = collection.len(),
                                    elapsed = ?t0.elapsed(),
                                    "collection recovered"
                                );
                                self.collections
                                    .write()
                                    .insert(name, Arc::new(collection));
                            }
                            Err(err) => {
                                tracing::error!(
                                    collection = %name,
                                    error = %err,
                                    "open collection failed"
                                );
                                let mut slot = first_error.lock();
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                            }
                        }
                    }
                });
            }
        });

        if let Some(err) = first_error.into_inner() {
            *self.status.write() = Status::Closing;
            for (_, collection) in self.collections.write().drain() {
                let _ = collection.close();
            }
            return Err(err);
        }

        *self.status.write() = Status::Operating;
        tracing::info!(
            collections = self.collections.read().len(),
            elapsed = ?started.elapsed(),
            "database ready"
        );
        Ok(())
    }

    /// Load, then park until [`Database::stop`].
    pub fn start(&self) -> Result<()> {
        self.load()?;
        let _ = self.exit_signal.recv();
        Ok(())
    }

    /// Transition to closing and close every collection. The last close
    /// error, if any, is returned.
    pub fn stop(&self) -> Result<()> {
        *self.status.write() = Status::Closing;

        let mut last_error = None;
        for (name, collection) in self.list_collections() {
            tracing::info!(collection = %name, "closing collection");
            if let Err(err) = collection.close() {
                tracing::error!(collection = %name, error = %err, "close failed");
                last_error = Some(err);
            }
        }

        self.bus.close();
        self.exit.lock().take();

        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Every file under `dir` becomes one collection, named by its path
/// relative to `dir`.
fn collect_collection_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).map_err(NestError::read_failed)? {
            let entry = entry.map_err(NestError::read_failed)?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let name = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            if name.starts_with('.') {
                // Bookkeeping files (replication progress) are not logs.
                continue;
            }
            files.push((name, path));
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn database(dir: &Path) -> Database {
        Database::new(DatabaseConfig {
            dir: dir.to_path_buf(),
            driver: "file".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_create_get_list_drop() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        db.load().unwrap();

        db.create_collection("users").unwrap();
        assert!(db.get_collection("users").is_ok());
        assert_eq!(db.list_collections().len(), 1);

        let err = db.create_collection("users").unwrap_err();
        assert_eq!(err.kind(), "collection_exists");

        db.drop_collection("users").unwrap();
        assert_eq!(
            db.get_collection("users").unwrap_err().kind(),
            "collection_not_found"
        );
        assert!(!dir.path().join("users").exists());

        assert_eq!(
            db.drop_collection("users").unwrap_err().kind(),
            "collection_not_found"
        );
    }

    #[test]
    fn test_load_recovers_existing_collections() {
        let dir = tempdir().unwrap();
        {
            let db = database(dir.path());
            db.load().unwrap();
            let users = db.create_collection("users").unwrap();
            users.insert(&json!({"id": "a"})).unwrap();
            let events = db.create_collection("events").unwrap();
            events.insert(&json!({"kind": "login"})).unwrap();
            events.insert(&json!({"kind": "logout"})).unwrap();
            db.stop().unwrap();
        }

        let db = database(dir.path());
        assert_eq!(db.status(), Status::Opening);
        db.load().unwrap();
        assert_eq!(db.status(), Status::Operating);

        assert_eq!(db.get_collection("users").unwrap().len(), 1);
        assert_eq!(db.get_collection("events").unwrap().len(), 2);
    }

    #[test]
    fn test_nested_paths_become_collection_names() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tenants")).unwrap();
        std::fs::write(
            dir.path().join("tenants/acme"),
            "{\"name\":\"insert\",\"uuid\":\"u\",\"timestamp\":0,\"start_byte\":0,\"payload\":{\"id\":\"a\"}}\n",
        )
        .unwrap();

        let db = database(dir.path());
        db.load().unwrap();
        assert_eq!(db.get_collection("tenants/acme").unwrap().len(), 1);
    }

    #[test]
    fn test_load_failure_closes_everything() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("good"), "").unwrap();
        std::fs::write(dir.path().join("bad"), "this is not json\n").unwrap();

        let db = database(dir.path());
        assert!(db.load().is_err());
        assert_eq!(db.status(), Status::Closing);
        assert!(db.list_collections().is_empty());
    }

    #[test]
    fn test_hidden_files_are_ignored() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".replication-progress.json"), "{}").unwrap();

        let db = database(dir.path());
        db.load().unwrap();
        assert!(db.list_collections().is_empty());
    }

    #[test]
    fn test_stop_closes_collections() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        db.load().unwrap();
        let users = db.create_collection("users").unwrap();
        db.stop().unwrap();

        assert_eq!(db.status(), Status::Closing);
        assert_eq!(
            users.insert(&json!({"id": "a"})).unwrap_err().kind(),
            "collection_closed"
        );
    }

    #[test]
    fn test_start_parks_until_stop() {
        let dir = tempdir().unwrap();
        let db = Arc::new(database(dir.path()));

        let runner = {
            let db = Arc::clone(&db);
            std::thread::spawn(move || db.start())
        };

        // Wait for the database to come up, then stop it.
        for _ in 0..100 {
            if db.status() == Status::Operating {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(db.status(), Status::Operating);
        db.stop().unwrap();
        runner.join().unwrap().unwrap();
    }
}
