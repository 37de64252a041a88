//! Ordered B-tree index over a composite field key.
//!
//! Keys are the declared fields extracted in order and compared
//! lexicographically with a total order over JSON scalars
//! (null < booleans < numbers < strings); equal keys fall back to
//! insertion order. Traversal supports optional bounds with per-bound
//! inclusivity and either direction; a bound may name a prefix of the
//! declared fields and then matches every key extending it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nestdb_common::{NestError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::index::Index;
use super::row::Row;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTreeIndexOptions {
    pub fields: Vec<String>,
    #[serde(default)]
    pub sparse: bool,
}

#[derive(Debug, Deserialize)]
struct BTreeTraverse {
    #[serde(default)]
    from: Option<Map<String, Value>>,
    #[serde(default)]
    to: Option<Map<String, Value>>,
    #[serde(default)]
    reverse: bool,
    #[serde(default = "default_true")]
    from_inclusive: bool,
    #[serde(default)]
    to_inclusive: bool,
}

fn default_true() -> bool {
    true
}

// Key ordering

/// A JSON scalar with a total order, usable as a tree key component.
#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Scalar {
    fn rank(&self) -> u8 {
        match self {
            Scalar::Null => 0,
            Scalar::Bool(_) => 1,
            Scalar::Number(_) => 2,
            Scalar::String(_) => 3,
        }
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Scalar::Null),
            Value::Bool(b) => Ok(Scalar::Bool(*b)),
            Value::Number(n) => Ok(Scalar::Number(n.as_f64().unwrap_or(0.0))),
            Value::String(s) => Ok(Scalar::String(s.clone())),
            _ => Err(NestError::UnsupportedValueType(
                "btree keys must be JSON scalars".into(),
            )),
        }
    }
}

impl Eq for Scalar {}

impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::Number(a), Scalar::Number(b)) => a.total_cmp(b),
            (Scalar::String(a), Scalar::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Composite key: field components in declared order, insertion sequence
/// as the final tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CompositeKey {
    components: Vec<Scalar>,
    seq: u64,
}

/// Compare a full key against a bound that may be a prefix of it. A key
/// extending an equal prefix counts as equal to the bound.
fn cmp_bound(components: &[Scalar], bound: &[Scalar]) -> CmpOrdering {
    let n = bound.len().min(components.len());
    components[..n].cmp(&bound[..n])
}

pub struct BTreeIndex {
    options: BTreeIndexOptions,
    tree: Mutex<BTreeMap<CompositeKey, Arc<Row>>>,
    seq: AtomicU64,
}

impl BTreeIndex {
    pub fn new(options: BTreeIndexOptions) -> Self {
        Self {
            options,
            tree: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Registry builder: validate options and construct.
    pub fn build(options: &Value) -> Result<Arc<dyn Index>> {
        let options: BTreeIndexOptions = serde_json::from_value(options.clone())
            .map_err(|e| NestError::InvalidOptions(e.to_string()))?;
        if options.fields.is_empty() {
            return Err(NestError::InvalidOptions(
                "at least one field is required".into(),
            ));
        }
        Ok(Arc::new(Self::new(options)))
    }

    /// Extract the key components for a row, or None when any declared
    /// field is absent.
    fn components_for(&self, item: &Map<String, Value>) -> Result<Option<Vec<Scalar>>> {
        let mut components = Vec::with_capacity(self.options.fields.len());
        for field in &self.options.fields {
            match item.get(field) {
                Some(value) => components.push(Scalar::from_value(value)?),
                None => return Ok(None),
            }
        }
        Ok(Some(components))
    }

    /// Build the key components named by a traversal bound, stopping at the
    /// first declared field the bound omits (prefix bounds).
    fn bound_components(&self, bound: &Map<String, Value>) -> Result<Vec<Scalar>> {
        let mut components = Vec::with_capacity(self.options.fields.len());
        for field in &self.options.fields {
            match bound.get(field) {
                Some(value) => components.push(Scalar::from_value(value)?),
                None => break,
            }
        }
        Ok(components)
    }
}

impl Index for BTreeIndex {
    fn add_row(&self, row: &Arc<Row>) -> Result<()> {
        let item = row.decode()?;
        let components = match self.components_for(&item)? {
            Some(components) => components,
            None if self.options.sparse => return Ok(()),
            None => {
                let missing = self
                    .options
                    .fields
                    .iter()
                    .find(|f| !item.contains_key(*f))
                    .cloned()
                    .unwrap_or_default();
                return Err(NestError::MissingIndexedField(missing));
            }
        };

        let key = CompositeKey {
            components,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.tree.lock().insert(key, Arc::clone(row));
        Ok(())
    }

    fn remove_row(&self, row: &Arc<Row>) -> Result<()> {
        let item = row.decode()?;
        let components = match self.components_for(&item)? {
            Some(components) => components,
            None => return Ok(()),
        };

        let mut tree = self.tree.lock();
        let range = (
            Bound::Included(CompositeKey {
                components: components.clone(),
                seq: 0,
            }),
            Bound::Included(CompositeKey {
                components,
                seq: u64::MAX,
            }),
        );
        let found = tree
            .range(range)
            .find(|(_, candidate)| Arc::ptr_eq(candidate, row))
            .map(|(key, _)| key.clone());
        if let Some(key) = found {
            tree.remove(&key);
        }
        Ok(())
    }

    fn traverse(&self, params: &Value, visit: &mut dyn FnMut(Arc<Row>) -> bool) -> Result<()> {
        let params: BTreeTraverse = serde_json::from_value(params.clone())
            .map_err(|e| NestError::InvalidOptions(e.to_string()))?;

        let from = match &params.from {
            Some(bound) => Some((self.bound_components(bound)?, params.from_inclusive)),
            None => None,
        };
        let to = match &params.to {
            Some(bound) => Some((self.bound_components(bound)?, params.to_inclusive)),
            None => None,
        };

        let tree = self.tree.lock();
        if params.reverse {
            // `from` is where iteration starts, which in reverse is the
            // upper end of the key space.
            for (key, row) in tree.iter().rev() {
                if let Some((bound, inclusive)) = &from {
                    match cmp_bound(&key.components, bound) {
                        CmpOrdering::Greater => continue,
                        CmpOrdering::Equal if !inclusive => continue,
                        _ => {}
                    }
                }
                if let Some((bound, inclusive)) = &to {
                    match cmp_bound(&key.components, bound) {
                        CmpOrdering::Less => break,
                        CmpOrdering::Equal if !inclusive => break,
                        _ => {}
                    }
                }
                if !visit(Arc::clone(row)) {
                    break;
                }
            }
        } else {
            // Seek to the first candidate, then filter the boundary keys.
            let start = match &from {
                Some((bound, _)) => Bound::Included(CompositeKey {
                    components: bound.clone(),
                    seq: 0,
                }),
                None => Bound::Unbounded,
            };
            for (key, row) in tree.range((start, Bound::Unbounded)) {
                if let Some((bound, inclusive)) = &from {
                    match cmp_bound(&key.components, bound) {
                        CmpOrdering::Less => continue,
                        CmpOrdering::Equal if !inclusive => continue,
                        _ => {}
                    }
                }
                if let Some((bound, inclusive)) = &to {
                    match cmp_bound(&key.components, bound) {
                        CmpOrdering::Greater => break,
                        CmpOrdering::Equal if !inclusive => break,
                        _ => {}
                    }
                }
                if !visit(Arc::clone(row)) {
                    break;
                }
            }
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

    fn index(fields: &[&str]) -> BTreeIndex {
        BTreeIndex::new(BTreeIndexOptions {
            fields: fields.iter().map(|s| s.to_string()).collect(),
            sparse: false,
        })
    }

    fn collect_field(index: &BTreeIndex, params: Value, field: &str) -> Vec<Value> {
        let mut out = Vec::new();
        index
            .traverse(&params, &mut |row| {
                out.push(row.decode().unwrap().get(field).cloned().unwrap());
                true
            })
            .unwrap();
        out
    }

    #[test]
    fn test_ordered_scan() {
        let index = index(&["age"]);
        for payload in ["{\"age\":31}", "{\"age\":29}", "{\"age\":30}"] {
            index.add_row(&row(payload)).unwrap();
        }
        assert_eq!(
            collect_field(&index, json!({}), "age"),
            vec![json!(29), json!(30), json!(31)]
        );
        assert_eq!(
            collect_field(&index, json!({"reverse": true}), "age"),
            vec![json!(31), json!(30), json!(29)]
        );
    }

    #[test]
    fn test_bounds_and_inclusivity() {
        let index = index(&["age"]);
        for age in [10, 20, 30, 40] {
            index.add_row(&row(&format!("{{\"age\":{age}}}"))).unwrap();
        }

        // Default: from inclusive, to exclusive.
        assert_eq!(
            collect_field(&index, json!({"from": {"age": 20}, "to": {"age": 40}}), "age"),
            vec![json!(20), json!(30)]
        );
        assert_eq!(
            collect_field(
                &index,
                json!({"from": {"age": 20}, "from_inclusive": false, "to": {"age": 40}, "to_inclusive": true}),
                "age"
            ),
            vec![json!(30), json!(40)]
        );
    }

    #[test]
    fn test_reverse_starts_at_from() {
        let index = index(&["age"]);
        for age in [10, 20, 30, 40] {
            index.add_row(&row(&format!("{{\"age\":{age}}}"))).unwrap();
        }
        assert_eq!(
            collect_field(&index, json!({"from": {"age": 30}, "reverse": true}), "age"),
            vec![json!(30), json!(20), json!(10)]
        );
    }

    #[test]
    fn test_composite_key_tie_break() {
        let index = index(&["group", "name"]);
        index.add_row(&row("{\"group\":\"b\",\"name\":\"x\"}")).unwrap();
        index.add_row(&row("{\"group\":\"a\",\"name\":\"z\"}")).unwrap();
        index.add_row(&row("{\"group\":\"a\",\"name\":\"y\"}")).unwrap();

        assert_eq!(
            collect_field(&index, json!({}), "name"),
            vec![json!("y"), json!("z"), json!("x")]
        );
    }

    #[test]
    fn test_prefix_bound_covers_extensions() {
        let index = index(&["group", "name"]);
        index.add_row(&row("{\"group\":\"a\",\"name\":\"x\"}")).unwrap();
        index.add_row(&row("{\"group\":\"b\",\"name\":\"y\"}")).unwrap();
        index.add_row(&row("{\"group\":\"b\",\"name\":\"z\"}")).unwrap();
        index.add_row(&row("{\"group\":\"c\",\"name\":\"w\"}")).unwrap();

        // Inclusive prefix bound keeps every key extending it.
        assert_eq!(
            collect_field(
                &index,
                json!({"from": {"group": "b"}, "to": {"group": "b"}, "to_inclusive": true}),
                "name"
            ),
            vec![json!("y"), json!("z")]
        );
        // Exclusive prefix bound drops them all.
        assert_eq!(
            collect_field(&index, json!({"to": {"group": "b"}}), "name"),
            vec![json!("x")]
        );
    }

    #[test]
    fn test_equal_keys_keep_insertion_order() {
        let index = index(&["group"]);
        index.add_row(&row("{\"group\":\"a\",\"n\":1}")).unwrap();
        index.add_row(&row("{\"group\":\"a\",\"n\":2}")).unwrap();
        index.add_row(&row("{\"group\":\"a\",\"n\":3}")).unwrap();

        assert_eq!(
            collect_field(&index, json!({}), "n"),
            vec![json!(1), json!(2), json!(3)]
        );
    }

    #[test]
    fn test_scalar_type_order() {
        let index = index(&["v"]);
        index.add_row(&row("{\"v\":\"s\"}")).unwrap();
        index.add_row(&row("{\"v\":null}")).unwrap();
        index.add_row(&row("{\"v\":5}")).unwrap();
        index.add_row(&row("{\"v\":true}")).unwrap();

        assert_eq!(
            collect_field(&index, json!({}), "v"),
            vec![json!(null), json!(true), json!(5), json!("s")]
        );
    }

    #[test]
    fn test_remove_by_identity() {
        let index = index(&["group"]);
        let a = row("{\"group\":\"a\"}");
        let b = row("{\"group\":\"a\"}");
        index.add_row(&a).unwrap();
        index.add_row(&b).unwrap();

        index.remove_row(&a).unwrap();
        let mut remaining = Vec::new();
        index
            .traverse(&json!({}), &mut |row| {
                remaining.push(row);
                true
            })
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &b));
    }

    #[test]
    fn test_missing_field_rejected_unless_sparse() {
        let index = index(&["age"]);
        assert_eq!(
            index.add_row(&row("{}")).unwrap_err().kind(),
            "missing_indexed_field"
        );

        let sparse = BTreeIndex::new(BTreeIndexOptions {
            fields: vec!["age".into()],
            sparse: true,
        });
        sparse.add_row(&row("{}")).unwrap();
    }
}
