//! Unique map index: one key, one row.
//!
//! Keys come from a single named field whose value is a string or an array
//! of strings (every element becomes a key and all must be unique). Missing
//! fields reject the row unless the index is sparse.

use std::collections::HashMap;
use std::sync::Arc;

use nestdb_common::{NestError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::index::Index;
use super::row::Row;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapIndexOptions {
    pub field: String,
    #[serde(default)]
    pub sparse: bool,
}

#[derive(Debug, Deserialize)]
struct MapTraverse {
    value: String,
}

pub struct MapIndex {
    options: MapIndexOptions,
    entries: RwLock<HashMap<String, Arc<Row>>>,
}

impl MapIndex {
    pub fn new(options: MapIndexOptions) -> Self {
        Self {
            options,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registry builder: validate options and construct.
    pub fn build(options: &Value) -> Result<Arc<dyn Index>> {
        let options: MapIndexOptions = serde_json::from_value(options.clone())
            .map_err(|e| NestError::InvalidOptions(e.to_string()))?;
        if options.field.is_empty() {
            return Err(NestError::InvalidOptions("field is required".into()));
        }
        Ok(Arc::new(Self::new(options)))
    }

    /// Look up the row for an exact key.
    pub fn get(&self, key: &str) -> Option<Arc<Row>> {
        self.entries.read().get(key).cloned()
    }

    /// Extract the index keys for a row, or None when the field is absent.
    fn keys_for(&self, row: &Arc<Row>) -> Result<Option<Vec<String>>> {
        let item = row.decode()?;
        let value = match item.get(&self.options.field) {
            Some(v) => v,
            None => return Ok(None),
        };
        match value {
            Value::String(s) => Ok(Some(vec![s.clone()])),
            Value::Array(items) => {
                let mut keys = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => keys.push(s.to_string()),
                        None => {
                            return Err(NestError::UnsupportedValueType(format!(
                                "field '{}' must contain only strings",
                                self.options.field
                            )))
                        }
                    }
                }
                Ok(Some(keys))
            }
            _ => Err(NestError::UnsupportedValueType(format!(
                "field '{}' must be a string or an array of strings",
                self.options.field
            ))),
        }
    }
}

impl Index for MapIndex {
    fn add_row(&self, row: &Arc<Row>) -> Result<()> {
        let keys = match self.keys_for(row)? {
            Some(keys) => keys,
            None if self.options.sparse => return Ok(()),
            None => {
                return Err(NestError::MissingIndexedField(self.options.field.clone()));
            }
        };

        let mut entries = self.entries.write();
        for key in &keys {
            if entries.contains_key(key) {
                return Err(NestError::IndexConflict {
                    field: self.options.field.clone(),
                    value: key.clone(),
                });
            }
        }
        for key in keys {
            entries.insert(key, Arc::clone(row));
        }
        Ok(())
    }

    fn remove_row(&self, row: &Arc<Row>) -> Result<()> {
        let keys = match self.keys_for(row)? {
            Some(keys) => keys,
            None => return Ok(()),
        };

        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(&key);
        }
        Ok(())
    }

    fn traverse(&self, params: &Value, visit: &mut dyn FnMut(Arc<Row>) -> bool) -> Result<()> {
        let params: MapTraverse = serde_json::from_value(params.clone())
            .map_err(|e| NestError::InvalidOptions(e.to_string()))?;
        if let Some(row) = self.get(&params.value) {
            visit(row);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn row(payload: &str) -> Arc<Row> {
        Arc::new(Row::new(Bytes::copy_from_slice(payload.as_bytes())))
    }

    fn index(field: &str, sparse: bool) -> MapIndex {
        MapIndex::new(MapIndexOptions {
            field: field.to_string(),
            sparse,
        })
    }

    #[test]
    fn test_add_and_lookup() {
        let index = index("id", false);
        let r = row("{\"id\":\"a\"}");
        index.add_row(&r).unwrap();
        assert!(Arc::ptr_eq(&index.get("a").unwrap(), &r));
    }

    #[test]
    fn test_conflict_on_duplicate_key() {
        let index = index("id", false);
        index.add_row(&row("{\"id\":\"a\"}")).unwrap();

        let err = index.add_row(&row("{\"id\":\"a\"}")).unwrap_err();
        assert_eq!(err.kind(), "index_conflict");
        assert_eq!(err.to_string(), "index conflict: field 'id' with value 'a'");
    }

    #[test]
    fn test_array_values_index_every_element() {
        let index = index("emails", false);
        let r = row("{\"emails\":[\"x@a\",\"y@a\"]}");
        index.add_row(&r).unwrap();
        assert!(index.get("x@a").is_some());
        assert!(index.get("y@a").is_some());

        // A later row colliding on any element conflicts, and nothing of it
        // is left behind.
        let err = index.add_row(&row("{\"emails\":[\"z@a\",\"y@a\"]}")).unwrap_err();
        assert_eq!(err.kind(), "index_conflict");
        assert!(index.get("z@a").is_none());
    }

    #[test]
    fn test_missing_field_mandatory_vs_sparse() {
        let mandatory = index("id", false);
        let err = mandatory.add_row(&row("{\"other\":1}")).unwrap_err();
        assert_eq!(err.kind(), "missing_indexed_field");

        let sparse = index("id", true);
        sparse.add_row(&row("{\"other\":1}")).unwrap();
        assert!(sparse.entries.read().is_empty());
    }

    #[test]
    fn test_non_string_values_rejected() {
        let index = index("id", false);
        assert_eq!(
            index.add_row(&row("{\"id\":42}")).unwrap_err().kind(),
            "unsupported_value_type"
        );
        assert_eq!(
            index.add_row(&row("{\"id\":[1,2]}")).unwrap_err().kind(),
            "unsupported_value_type"
        );
    }

    #[test]
    fn test_remove_clears_all_keys() {
        let index = index("emails", false);
        let r = row("{\"emails\":[\"x@a\",\"y@a\"]}");
        index.add_row(&r).unwrap();
        index.remove_row(&r).unwrap();
        assert!(index.get("x@a").is_none());
        assert!(index.get("y@a").is_none());
    }

    #[test]
    fn test_traverse_by_value() {
        let index = index("id", false);
        let r = row("{\"id\":\"a\"}");
        index.add_row(&r).unwrap();

        let mut seen = Vec::new();
        index
            .traverse(&json!({"value": "a"}), &mut |row| {
                seen.push(row.payload());
                true
            })
            .unwrap();
        assert_eq!(seen.len(), 1);

        index
            .traverse(&json!({"value": "missing"}), &mut |_| panic!("no match expected"))
            .unwrap();
    }
}
