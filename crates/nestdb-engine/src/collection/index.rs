//! Index capability trait and the index type registry.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use nestdb_common::{NestError, Result};
use parking_lot::RwLock;
use serde_json::Value;

use super::index_btree::BTreeIndex;
use super::index_hash::HashIndex;
use super::index_map::MapIndex;
use super::row::Row;

/// The capability set every index implements.
///
/// Indexes hold row pointers and are internally synchronized; the
/// collection never takes an index lock itself.
pub trait Index: Send + Sync {
    /// Index a row. Returns an error on constraint violation; the caller
    /// rolls back by removing the row from indexes already updated.
    fn add_row(&self, row: &Arc<Row>) -> Result<()>;

    /// Remove a row from the index, matching by row identity.
    fn remove_row(&self, row: &Arc<Row>) -> Result<()>;

    /// Visit rows selected by type-specific `params`. The visitor returns
    /// false to stop early.
    fn traverse(&self, params: &Value, visit: &mut dyn FnMut(Arc<Row>) -> bool) -> Result<()>;
}

impl std::fmt::Debug for dyn Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Index")
    }
}

/// A registered index type: its tag and a builder that validates options.
pub struct IndexDefinition {
    pub type_name: &'static str,
    pub build: fn(options: &Value) -> Result<Arc<dyn Index>>,
}

/// Named index type set. The process-wide default carries `map`, `btree`
/// and `hash`; tests construct their own.
pub struct IndexRegistry {
    definitions: RwLock<HashMap<&'static str, IndexDefinition>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Register an index type. Duplicate type names fail.
    pub fn register(&self, definition: IndexDefinition) -> Result<()> {
        if definition.type_name.is_empty() {
            return Err(NestError::InvalidOptions(
                "index type name cannot be empty".into(),
            ));
        }
        let mut definitions = self.definitions.write();
        if definitions.contains_key(definition.type_name) {
            return Err(NestError::InvalidOptions(format!(
                "index type '{}' already registered",
                definition.type_name
            )));
        }
        definitions.insert(definition.type_name, definition);
        Ok(())
    }

    /// Build an index instance for a type tag from its options object.
    pub fn build(&self, type_name: &str, options: &Value) -> Result<Arc<dyn Index>> {
        let definitions = self.definitions.read();
        let definition = definitions
            .get(type_name)
            .ok_or_else(|| NestError::UnsupportedIndexType(type_name.to_string()))?;
        (definition.build)(options)
    }

    /// Registered type tags, sorted.
    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.definitions.read().keys().copied().collect();
        types.sort_unstable();
        types
    }
}

impl Default for IndexRegistry {
    fn default() -> Self {
        let registry = Self::new();
        registry
            .register(IndexDefinition {
                type_name: "map",
                build: MapIndex::build,
            })
            .expect("register map index");
        registry
            .register(IndexDefinition {
                type_name: "btree",
                build: BTreeIndex::build,
            })
            .expect("register btree index");
        registry
            .register(IndexDefinition {
                type_name: "hash",
                build: HashIndex::build,
            })
            .expect("register hash index");
        registry
    }
}

static GLOBAL_REGISTRY: LazyLock<IndexRegistry> = LazyLock::new(IndexRegistry::default);

/// The process-wide index type registry.
pub fn registry() -> &'static IndexRegistry {
    &GLOBAL_REGISTRY
}
