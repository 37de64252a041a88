//! Hash multi-map index: key to list of rows, no uniqueness.

use std::collections::HashMap;
use std::sync::Arc;

use nestdb_common::{NestError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::index::Index;
use super::row::Row;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashIndexOptions {
    pub field: String,
}

#[derive(Debug, Deserialize)]
struct HashTraverse {
    value: String,
}

pub struct HashIndex {
    options: HashIndexOptions,
    entries: RwLock<HashMap<String, Vec<Arc<Row>>>>,
}

impl HashIndex {
    pub fn new(options: HashIndexOptions) -> Self {
        Self {
            options,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registry builder: validate options and construct.
    pub fn build(options: &Value) -> Result<Arc<dyn Index>> {
        let options: HashIndexOptions = serde_json::from_value(options.clone())
            .map_err(|e| NestError::InvalidOptions(e.to_string()))?;
        if options.field.is_empty() {
            return Err(NestError::InvalidOptions("field is required".into()));
        }
        Ok(Arc::new(Self::new(options)))
    }

    /// Extract the bucket keys for a row. Rows without the field are
    /// simply not indexed.
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

impl Index for HashIndex {
    fn add_row(&self, row: &Arc<Row>) -> Result<()> {
        let keys = match self.keys_for(row)? {
            Some(keys) => keys,
            None => return Ok(()),
        };

        let mut entries = self.entries.write();
        for key in keys {
            entries.entry(key).or_default().push(Arc::clone(row));
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
            if let Some(bucket) = entries.get_mut(&key) {
                // Match by identity, not payload equality.
                if let Some(pos) = bucket.iter().position(|c| Arc::ptr_eq(c, row)) {
                    bucket.remove(pos);
                }
                if bucket.is_empty() {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn traverse(&self, params: &Value, visit: &mut dyn FnMut(Arc<Row>) -> bool) -> Result<()> {
        let params: HashTraverse = serde_json::from_value(params.clone())
            .map_err(|e| NestError::InvalidOptions(e.to_string()))?;

        // Snapshot the bucket so the visitor runs without the index lock.
        let rows = {
            let entries = self.entries.read();
            entries.get(&params.value).cloned().unwrap_or_default()
        };
        for row in rows {
            if !visit(row) {
                break;
            }
        }
        Ok(())
    }
}
