//! The collection engine.
//!
//! A collection is an in-memory row table plus a set of named indexes,
//! backed by an append-only command log. Every mutation updates memory
//! first, then appends one command record; replaying the log from empty
//! reconstructs the collection. Removal swaps the last row into the freed
//! position, so commands address rows by their position at command time
//! and the log must replay in exact append order.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;
use nestdb_common::{is_empty_diff, merge_patch, merge_patch_diff, NestError, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::persistence::{Driver, LogWriter, Store};
use crate::replication::Bus;

use super::command::{
    Command, CreateIndexPayload, DropIndexPayload, PatchPayload, RemovePayload, CMD_CREATE_INDEX,
    CMD_DROP_INDEX, CMD_INSERT, CMD_PATCH, CMD_REMOVE, CMD_SET_DEFAULTS,
};
use super::defaults::Defaults;
use super::index::{self, Index};
use super::row::Row;

/// A named index installed on a collection.
pub struct CollectionIndex {
    pub type_name: String,
    pub options: Value,
    pub index: Arc<dyn Index>,
}

/// The append writer plus the byte offset of the next command.
struct LogHandle {
    writer: Box<dyn LogWriter>,
    position: i64,
}

pub struct Collection {
    name: String,
    path: PathBuf,
    driver: Arc<dyn Driver>,
    store: Box<dyn Store>,
    /// None after close; holding the mutex across the buffered write keeps
    /// command records whole and defines the total mutation order.
    log: Mutex<Option<LogHandle>>,
    rows: RwLock<Vec<Arc<Row>>>,
    indexes: RwLock<IndexMap<String, Arc<CollectionIndex>>>,
    defaults: RwLock<Option<Defaults>>,
    /// Monotonic insert counter, never decremented; feeds `auto()`.
    count: AtomicI64,
    bus: Option<Arc<Bus>>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Collection {
    /// Open a collection, replaying its log into memory, then switch the
    /// log to append mode.
    pub fn open(
        driver: Arc<dyn Driver>,
        path: impl Into<PathBuf>,
        name: impl Into<String>,
        bus: Option<Arc<Bus>>,
    ) -> Result<Self> {
        let path = path.into();
        let store = driver.open(&path)?;

        let collection = Self {
            name: name.into(),
            path,
            driver,
            store,
            log: Mutex::new(None),
            rows: RwLock::new(Vec::new()),
            indexes: RwLock::new(IndexMap::new()),
            defaults: RwLock::new(None),
            count: AtomicI64::new(0),
            bus,
        };

        let mut position = 0i64;
        {
            let mut reader = BufReader::new(collection.store.reader()?);
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader
                    .read_line(&mut line)
                    .map_err(NestError::read_failed)?;
                if n == 0 {
                    break;
                }
                position += n as i64;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let command: Command = serde_json::from_str(trimmed)?;
                if let Err(err) = collection.apply_command(&command, false) {
                    // Inserts are load-bearing for every later position;
                    // anything else is replayed best-effort.
                    if command.name == CMD_INSERT {
                        return Err(err);
                    }
                    tracing::warn!(
                        collection = %collection.name,
                        command = %command.name,
                        error = %err,
                        "skipping unreplayable command"
                    );
                }
            }
        }

        let writer = collection.store.append_writer()?;
        *collection.log.lock() = Some(LogHandle { writer, position });

        Ok(collection)
    }

    /// Collection name as registered in the database.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of inserts ever applied (monotonic; feeds `auto()`).
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequential reader over the full log, for history replay.
    pub fn log_reader(&self) -> Result<Box<dyn std::io::Read + Send>> {
        self.store.reader()
    }

    // Mutations

    /// Insert a document. Defaults are merged under the user's fields,
    /// indexes update first (with rollback), then the row enters the table
    /// and the command is appended.
    pub fn insert<T: Serialize>(&self, item: &T) -> Result<Arc<Row>> {
        self.ensure_open()?;

        let value = serde_json::to_value(item)?;
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(NestError::MalformedJson(format!(
                    "document must be a JSON object, got {other}"
                )))
            }
        };

        let auto = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let defaults = self.defaults.read().clone();
        if let Some(defaults) = defaults {
            object = defaults.apply(&object, auto);
        }

        let encoded = serde_json::to_string(&Value::Object(object))?;
        let payload = Bytes::from(encoded.clone().into_bytes());
        let row = self.add_row(payload)?;

        self.persist_command(CMD_INSERT, RawValue::from_string(encoded)?)?;

        Ok(row)
    }

    /// Remove a row. The log records the row's position at removal time;
    /// the previous last row takes its place.
    pub fn remove(&self, row: &Arc<Row>) -> Result<()> {
        self.ensure_open()?;
        self.remove_row(row, true)
    }

    /// Apply an RFC 7396 merge patch to a row. A patch that changes
    /// nothing is a successful no-op and appends nothing.
    pub fn patch(&self, row: &Arc<Row>, patch: &Value) -> Result<()> {
        self.ensure_open()?;
        self.patch_row(row, patch, true)
    }

    /// Create a named index and populate it from the existing rows.
    pub fn create_index(&self, name: &str, type_name: &str, options: Value) -> Result<()> {
        self.ensure_open()?;
        self.create_index_inner(name, type_name, options, true)
    }

    /// Drop a named index.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.drop_index_inner(name, true)
    }

    /// Replace the insert defaults. String values `uuid()`, `unixnano()`
    /// and `auto()` are generator tokens; anything else is a literal.
    pub fn set_defaults(&self, defaults: Map<String, Value>) -> Result<()> {
        self.ensure_open()?;
        self.set_defaults_inner(defaults, true)
    }

    // Reads

    /// Visit rows in insertion order until the visitor returns false.
    pub fn traverse(&self, mut visit: impl FnMut(&Arc<Row>) -> bool) {
        let rows = self.rows.read();
        for row in rows.iter() {
            if !visit(row) {
                break;
            }
        }
    }

    /// Visit rows with positions in `[from, to)`; `to == 0` means the end.
    pub fn traverse_range(&self, from: usize, to: usize, mut visit: impl FnMut(&Arc<Row>) -> bool) {
        let rows = self.rows.read();
        for (i, row) in rows.iter().enumerate() {
            if i < from {
                continue;
            }
            if to > 0 && i >= to {
                break;
            }
            if !visit(row) {
                break;
            }
        }
    }

    /// Decode the first row, if any.
    pub fn find_one<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let row = { self.rows.read().first().cloned() };
        match row {
            Some(row) => Ok(Some(serde_json::from_slice(&row.payload())?)),
            None => Ok(None),
        }
    }

    /// The row currently at a position.
    pub fn row_at(&self, i: usize) -> Option<Arc<Row>> {
        self.rows.read().get(i).cloned()
    }

    /// Visit rows selected by a named index with type-specific params.
    pub fn index_traverse(
        &self,
        index_name: &str,
        params: &Value,
        visit: &mut dyn FnMut(Arc<Row>) -> bool,
    ) -> Result<()> {
        let entry = self
            .indexes
            .read()
            .get(index_name)
            .cloned()
            .ok_or_else(|| NestError::IndexNotFound(index_name.to_string()))?;
        entry.index.traverse(params, visit)
    }

    /// Installed index names in creation order.
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.read().keys().cloned().collect()
    }

    /// Look up an installed index.
    pub fn get_index(&self, name: &str) -> Option<Arc<CollectionIndex>> {
        self.indexes.read().get(name).cloned()
    }

    /// The current defaults object, if set.
    pub fn defaults(&self) -> Option<Map<String, Value>> {
        self.defaults.read().as_ref().map(|d| d.raw().clone())
    }

    // Lifecycle

    /// Flush and release the log writer. Later mutations fail with
    /// `CollectionClosed`; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut log = self.log.lock();
        match log.take() {
            Some(mut handle) => handle.writer.flush(),
            None => Ok(()),
        }
    }

    /// Close, then delete the backing log file.
    pub fn destroy(&self) -> Result<()> {
        self.close()?;
        self.driver.remove(&self.path)
    }

    /// Dispatcher shared by recovery and replication: apply one command,
    /// optionally persisting it to the local log.
    pub fn apply_command(&self, command: &Command, persist: bool) -> Result<()> {
        match command.name.as_str() {
            CMD_INSERT => {
                let payload = Bytes::copy_from_slice(command.payload.get().as_bytes());
                self.add_row(payload)?;
                self.count.fetch_add(1, Ordering::SeqCst);
                if persist {
                    self.persist_command(CMD_INSERT, command.payload.clone())?;
                }
                Ok(())
            }
            CMD_REMOVE => {
                let params: RemovePayload = serde_json::from_str(command.payload.get())?;
                let row = self
                    .row_at(params.i)
                    .ok_or(NestError::RowOutOfRange(params.i))?;
                self.remove_row(&row, persist)
            }
            CMD_PATCH => {
                let params: PatchPayload = serde_json::from_str(command.payload.get())?;
                let row = self
                    .row_at(params.i)
                    .ok_or(NestError::RowOutOfRange(params.i))?;
                let diff: Value = serde_json::from_str(params.diff.get())?;
                self.patch_row(&row, &diff, persist)
            }
            CMD_CREATE_INDEX => {
                let params: CreateIndexPayload = serde_json::from_str(command.payload.get())?;
                self.create_index_inner(&params.name, &params.index_type, params.options, persist)
            }
            CMD_DROP_INDEX => {
                let params: DropIndexPayload = serde_json::from_str(command.payload.get())?;
                self.drop_index_inner(&params.name, persist)
            }
            CMD_SET_DEFAULTS => {
                let defaults: Map<String, Value> = serde_json::from_str(command.payload.get())?;
                self.set_defaults_inner(defaults, persist)
            }
            other => Err(NestError::MalformedJson(format!(
                "unknown command '{other}'"
            ))),
        }
    }

    // Internals

    fn ensure_open(&self) -> Result<()> {
        if self.log.lock().is_none() {
            return Err(NestError::CollectionClosed);
        }
        Ok(())
    }

    /// Snapshot the index set so index work runs without the table lock.
    fn index_snapshot(&self) -> Vec<Arc<CollectionIndex>> {
        self.indexes.read().values().cloned().collect()
    }

    /// Index a row everywhere, then append it to the table.
    fn add_row(&self, payload: Bytes) -> Result<Arc<Row>> {
        let row = Arc::new(Row::new(payload));

        let indexes = self.index_snapshot();
        index_insert(&indexes, &row)?;

        let mut rows = self.rows.write();
        row.set_position(rows.len());
        rows.push(Arc::clone(&row));
        Ok(row)
    }

    fn remove_row(&self, row: &Arc<Row>, persist: bool) -> Result<()> {
        let i;
        {
            let mut rows = self.rows.write();
            i = row.position();
            if i >= rows.len() || !Arc::ptr_eq(&rows[i], row) {
                return Err(NestError::RowDoesNotExist(i));
            }

            let indexes = self.index_snapshot();
            index_remove(&indexes, row)?;

            rows.swap_remove(i);
            if i < rows.len() {
                rows[i].set_position(i);
            }
        }

        if persist {
            self.persist_payload(CMD_REMOVE, &RemovePayload { i })?;
        }
        Ok(())
    }

    fn patch_row(&self, row: &Arc<Row>, patch: &Value, persist: bool) -> Result<()> {
        let _serialize = row.lock_patch();

        let old_bytes = row.payload();
        let old: Value = serde_json::from_slice(&old_bytes)?;
        let new = merge_patch(&old, patch);
        let diff = merge_patch_diff(&old, &new);
        if is_empty_diff(&diff) {
            return Ok(());
        }

        let new_bytes = Bytes::from(serde_json::to_vec(&new)?);

        let indexes = self.index_snapshot();
        index_remove(&indexes, row)?;
        row.set_payload(new_bytes);
        if let Err(err) = index_insert(&indexes, row) {
            // Put the old payload back where the indexes expect it.
            row.set_payload(old_bytes);
            let _ = index_insert(&indexes, row);
            return Err(err);
        }

        if persist {
            let payload = PatchPayload {
                i: row.position(),
                diff: serde_json::value::to_raw_value(&diff)?,
            };
            self.persist_payload(CMD_PATCH, &payload)?;
        }
        Ok(())
    }

    fn create_index_inner(
        &self,
        name: &str,
        type_name: &str,
        options: Value,
        persist: bool,
    ) -> Result<()> {
        if self.indexes.read().contains_key(name) {
            return Err(NestError::IndexAlreadyExists(name.to_string()));
        }

        let built = index::registry().build(type_name, &options)?;
        let entry = Arc::new(CollectionIndex {
            type_name: type_name.to_string(),
            options: options.clone(),
            index: built,
        });

        {
            // Hold the table read lock across populate + install so no
            // insert can slip between them.
            let rows = self.rows.read();
            for row in rows.iter() {
                entry.index.add_row(row)?;
            }

            let mut indexes = self.indexes.write();
            if indexes.contains_key(name) {
                return Err(NestError::IndexAlreadyExists(name.to_string()));
            }
            indexes.insert(name.to_string(), Arc::clone(&entry));
        }

        if persist {
            let payload = CreateIndexPayload {
                name: name.to_string(),
                index_type: type_name.to_string(),
                options,
            };
            self.persist_payload(CMD_CREATE_INDEX, &payload)?;
        }
        Ok(())
    }

    fn drop_index_inner(&self, name: &str, persist: bool) -> Result<()> {
        {
            let mut indexes = self.indexes.write();
            if indexes.shift_remove(name).is_none() {
                return Err(NestError::IndexNotFound(name.to_string()));
            }
        }

        if persist {
            let payload = DropIndexPayload {
                name: name.to_string(),
            };
            self.persist_payload(CMD_DROP_INDEX, &payload)?;
        }
        Ok(())
    }

    fn set_defaults_inner(&self, defaults: Map<String, Value>, persist: bool) -> Result<()> {
        *self.defaults.write() = Some(Defaults::parse(defaults.clone()));

        if persist {
            self.persist_payload(CMD_SET_DEFAULTS, &defaults)?;
        }
        Ok(())
    }

    fn persist_payload<P: Serialize>(&self, name: &str, payload: &P) -> Result<()> {
        self.persist_command(name, serde_json::value::to_raw_value(payload)?)
    }

    /// Append one command under the log mutex, stamping its start offset,
    /// then publish it for replication. Publishing inside the mutex keeps
    /// bus order identical to log order.
    fn persist_command(&self, name: &str, payload: Box<RawValue>) -> Result<()> {
        let mut command = Command::new(name, payload);

        let mut log = self.log.lock();
        let handle = log.as_mut().ok_or(NestError::CollectionClosed)?;
        command.start_byte = handle.position;

        let line = command.encode_line()?;
        handle.writer.write_all(&line)?;
        handle.position += line.len() as i64;

        if let Some(bus) = &self.bus {
            bus.publish(&self.name, &line[..line.len() - 1]);
        }
        Ok(())
    }
}

/// Add a row to every index; on failure undo the ones already updated.
fn index_insert(indexes: &[Arc<CollectionIndex>], row: &Arc<Row>) -> Result<()> {
    let mut added = 0;
    for entry in indexes {
        if let Err(err) = entry.index.add_row(row) {
            for done in &indexes[..added] {
                let _ = done.index.remove_row(row);
            }
            return Err(err);
        }
        added += 1;
    }
    Ok(())
}

fn index_remove(indexes: &[Arc<CollectionIndex>], row: &Arc<Row>) -> Result<()> {
    for entry in indexes {
        entry.index.remove_row(row)?;
    }
    Ok(())
}
