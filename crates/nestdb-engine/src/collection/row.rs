//! The in-memory row: one stored document.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use nestdb_common::{NestError, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::{Map, Value};

/// A single document held by a collection.
///
/// `position` is the row's current index in the row table and is only
/// mutated under the row-table write lock (removal relocates the last row).
/// The payload is the stored JSON object as raw bytes; indexes decode it on
/// demand. The patch mutex serializes concurrent patches to this one row
/// without blocking patches to other rows.
pub struct Row {
    position: AtomicUsize,
    payload: RwLock<Bytes>,
    patch_mutex: Mutex<()>,
}

impl Row {
    pub(crate) fn new(payload: Bytes) -> Self {
        Self {
            position: AtomicUsize::new(0),
            payload: RwLock::new(payload),
            patch_mutex: Mutex::new(()),
        }
    }

    /// Current position in the row table.
    pub fn position(&self) -> usize {
        self.position.load(Ordering::Acquire)
    }

    pub(crate) fn set_position(&self, i: usize) {
        self.position.store(i, Ordering::Release);
    }

    /// The stored JSON bytes. Cheap to clone.
    pub fn payload(&self) -> Bytes {
        self.payload.read().clone()
    }

    pub(crate) fn set_payload(&self, payload: Bytes) {
        *self.payload.write() = payload;
    }

    /// Decode the payload into a JSON object.
    pub fn decode(&self) -> Result<Map<String, Value>> {
        let payload = self.payload();
        match serde_json::from_slice::<Value>(&payload)? {
            Value::Object(obj) => Ok(obj),
            other => Err(NestError::MalformedJson(format!(
                "document must be a JSON object, got {other}"
            ))),
        }
    }

    pub(crate) fn lock_patch(&self) -> MutexGuard<'_, ()> {
        self.patch_mutex.lock()
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Row")
            .field("position", &self.position())
            .field("payload", &String::from_utf8_lossy(&self.payload()))
            .finish()
    }
}
