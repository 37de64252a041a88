//! Per-collection insert defaults.
//!
//! A defaults mapping assigns each field either a literal or a generator.
//! Generator tokens are parsed once at `set_defaults` time; user-supplied
//! fields always win over defaults.

use serde_json::{Map, Value};

/// A single default: literal value or generator.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Literal(Value),
    /// `uuid()`: fresh UUIDv4 string per insert.
    Uuid,
    /// `unixnano()`: insert time in nanoseconds.
    UnixNanos,
    /// `auto()`: the collection's monotonic insert counter.
    AutoCounter,
}

/// Parsed defaults for a collection, keeping declaration order.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    fields: Vec<(String, DefaultValue)>,
    raw: Map<String, Value>,
}

impl Defaults {
    /// Parse a defaults object, recognizing the generator tokens.
    pub fn parse(raw: Map<String, Value>) -> Self {
        let fields = raw
            .iter()
            .map(|(key, value)| {
                let parsed = match value.as_str() {
                    Some("uuid()") => DefaultValue::Uuid,
                    Some("unixnano()") => DefaultValue::UnixNanos,
                    Some("auto()") => DefaultValue::AutoCounter,
                    _ => DefaultValue::Literal(value.clone()),
                };
                (key.clone(), parsed)
            })
            .collect();
        Self { fields, raw }
    }

    /// The defaults object as originally supplied (for persistence).
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// Merge defaults under a document: generated and literal fields first,
    /// then the document's own fields on top.
    pub fn apply(&self, item: &Map<String, Value>, auto: i64) -> Map<String, Value> {
        let mut merged = Map::with_capacity(self.fields.len() + item.len());
        for (key, default) in &self.fields {
            let value = match default {
                DefaultValue::Literal(v) => v.clone(),
                DefaultValue::Uuid => Value::from(uuid::Uuid::new_v4().to_string()),
                DefaultValue::UnixNanos => Value::from(super::command::unix_nanos()),
                DefaultValue::AutoCounter => Value::from(auto),
            };
            merged.insert(key.clone(), value);
        }
        for (key, value) in item {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_parse_recognizes_generator_tokens() {
        let defaults = Defaults::parse(obj(json!({
            "id": "uuid()",
            "created_on": "unixnano()",
            "seq": "auto()",
            "status": "new",
            "retries": 0,
        })));

        let kinds: Vec<_> = defaults.fields.iter().map(|(_, v)| v.clone()).collect();
        assert_eq!(kinds[0], DefaultValue::Uuid);
        assert_eq!(kinds[1], DefaultValue::UnixNanos);
        assert_eq!(kinds[2], DefaultValue::AutoCounter);
        assert_eq!(kinds[3], DefaultValue::Literal(json!("new")));
        assert_eq!(kinds[4], DefaultValue::Literal(json!(0)));
    }

    #[test]
    fn test_apply_user_fields_win() {
        let defaults = Defaults::parse(obj(json!({"status": "new", "seq": "auto()"})));
        let merged = defaults.apply(&obj(json!({"status": "done", "name": "x"})), 42);

        assert_eq!(merged.get("status"), Some(&json!("done")));
        assert_eq!(merged.get("seq"), Some(&json!(42)));
        assert_eq!(merged.get("name"), Some(&json!("x")));
    }

    #[test]
    fn test_apply_generates_fresh_uuid() {
        let defaults = Defaults::parse(obj(json!({"id": "uuid()"})));
        let a = defaults.apply(&Map::new(), 1);
        let b = defaults.apply(&Map::new(), 2);
        assert_ne!(a.get("id"), b.get("id"));
        assert!(uuid::Uuid::parse_str(a.get("id").unwrap().as_str().unwrap()).is_ok());
    }
}
