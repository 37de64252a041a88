//! Pluggable persistence drivers.
//!
//! A driver turns a path into a [`Store`] that yields sequential readers
//! and a single buffered append-only writer. Drivers register by name; the
//! raw `file` driver is the default and a `snappy` framed driver is
//! available for compressed logs.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use nestdb_common::{NestError, Result};
use parking_lot::RwLock;

mod file;
mod snappy;

pub use file::FileDriver;
pub use snappy::SnappyDriver;

/// Name of the driver registered in every registry.
pub const DEFAULT_DRIVER: &str = "file";

/// Append-only buffered log writer.
///
/// Writes are buffered; nothing is guaranteed on disk until `flush`.
pub trait LogWriter: Send {
    /// Append the whole buffer. A framed driver encodes one frame per call.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Flush buffered bytes to the underlying file.
    fn flush(&mut self) -> Result<()>;
}

/// An opened log location.
pub trait Store: Send + Sync {
    /// Sequential reader over the full log from the beginning.
    ///
    /// Framed drivers decompress transparently; a truncated trailing frame
    /// reads as clean EOF.
    fn reader(&self) -> Result<Box<dyn Read + Send>>;

    /// Buffered append-only writer positioned at the end of the log.
    fn append_writer(&self) -> Result<Box<dyn LogWriter>>;
}

/// A persistence driver: opens stores and removes log files.
pub trait Driver: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Store>>;
    fn remove(&self, path: &Path) -> Result<()>;
}

// Driver registry

/// Named driver set. The process-wide default is populated once at startup;
/// tests construct their own.
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a driver under a name. Duplicate names fail.
    pub fn register(&self, name: &str, driver: Arc<dyn Driver>) -> Result<()> {
        if name.is_empty() {
            return Err(NestError::InvalidOptions(
                "driver name cannot be empty".into(),
            ));
        }
        let mut drivers = self.drivers.write();
        if drivers.contains_key(name) {
            return Err(NestError::InvalidOptions(format!(
                "driver '{name}' already registered"
            )));
        }
        drivers.insert(name.to_string(), driver);
        Ok(())
    }

    /// Look up a driver by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NestError::InvalidOptions(format!("driver '{name}' not registered")))
    }

    /// Names of all registered drivers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let registry = Self::new();
        registry
            .register(DEFAULT_DRIVER, Arc::new(FileDriver))
            .expect("register file driver");
        registry
            .register("snappy", Arc::new(SnappyDriver))
            .expect("register snappy driver");
        registry
    }
}

static GLOBAL_REGISTRY: LazyLock<DriverRegistry> = LazyLock::new(DriverRegistry::default);

/// The process-wide registry with `file` and `snappy` preinstalled.
pub fn registry() -> &'static DriverRegistry {
    &GLOBAL_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_builtin_drivers() {
        let registry = DriverRegistry::default();
        assert!(registry.get("file").is_ok());
        assert!(registry.get("snappy").is_ok());
        assert_eq!(registry.names(), vec!["file", "snappy"]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = DriverRegistry::default();
        let err = registry.register("file", Arc::new(FileDriver)).unwrap_err();
        assert_eq!(err.kind(), "invalid_options");
    }

    #[test]
    fn test_unknown_driver() {
        let registry = DriverRegistry::new();
        assert!(registry.get("tape").is_err());
    }
}
