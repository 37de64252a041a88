//! RFC 7396 JSON Merge Patch.
//!
//! `merge_patch` applies a patch; `merge_patch_diff` produces the minimal
//! patch that turns one document into another. A `null` patch value erases
//! the key, object values recurse, anything else replaces wholesale.

use serde_json::{Map, Value};

/// Apply an RFC 7396 merge patch to a target value.
///
/// Returns the patched value. The target is replaced wholesale unless both
/// the target and the patch are objects, in which case fields are merged
/// recursively and `null` patch fields erase target keys.
pub fn merge_patch(target: &Value, patch: &Value) -> Value {
    let patch_obj = match patch {
        Value::Object(obj) => obj,
        _ => return patch.clone(),
    };

    let mut result = match target {
        Value::Object(obj) => obj.clone(),
        _ => Map::new(),
    };

    for (key, value) in patch_obj {
        if value.is_null() {
            result.shift_remove(key);
        } else {
            let merged = match result.get(key) {
                Some(current) => merge_patch(current, value),
                None => merge_patch(&Value::Null, value),
            };
            result.insert(key.clone(), merged);
        }
    }

    Value::Object(result)
}

/// Compute the minimal RFC 7396 patch that transforms `original` into
/// `target`, such that `merge_patch(original, diff) == target`.
///
/// An empty object means the documents are already equal. Values that only
/// exist in `original` appear as `null` in the diff.
pub fn merge_patch_diff(original: &Value, target: &Value) -> Value {
    let (orig_obj, target_obj) = match (original, target) {
        (Value::Object(a), Value::Object(b)) => (a, b),
        _ => {
            if original == target {
                return Value::Object(Map::new());
            }
            return target.clone();
        }
    };

    let mut diff = Map::new();

    for key in orig_obj.keys() {
        if !target_obj.contains_key(key) {
            diff.insert(key.clone(), Value::Null);
        }
    }

    for (key, target_value) in target_obj {
        match orig_obj.get(key) {
            None => {
                diff.insert(key.clone(), target_value.clone());
            }
            Some(orig_value) if orig_value == target_value => {}
            Some(orig_value) => {
                if orig_value.is_object() && target_value.is_object() {
                    let nested = merge_patch_diff(orig_value, target_value);
                    diff.insert(key.clone(), nested);
                } else {
                    diff.insert(key.clone(), target_value.clone());
                }
            }
        }
    }

    Value::Object(diff)
}

/// Whether a diff produced by [`merge_patch_diff`] is a no-op.
pub fn is_empty_diff(diff: &Value) -> bool {
    matches!(diff, Value::Object(obj) if obj.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_erases_key() {
        let target = json!({"id": "a", "age": 30, "tag": "x"});
        let patch = json!({"age": 31, "tag": null});
        assert_eq!(merge_patch(&target, &patch), json!({"id": "a", "age": 31}));
    }

    #[test]
    fn test_objects_recurse() {
        let target = json!({"user": {"name": "ada", "role": "dev"}});
        let patch = json!({"user": {"role": "lead"}});
        assert_eq!(
            merge_patch(&target, &patch),
            json!({"user": {"name": "ada", "role": "lead"}})
        );
    }

    #[test]
    fn test_non_objects_replace_wholesale() {
        let target = json!({"tags": ["a", "b"]});
        let patch = json!({"tags": ["c"]});
        assert_eq!(merge_patch(&target, &patch), json!({"tags": ["c"]}));

        assert_eq!(merge_patch(&json!(1), &json!([1, 2])), json!([1, 2]));
        assert_eq!(merge_patch(&json!({"a": 1}), &json!("x")), json!("x"));
    }

    #[test]
    fn test_patching_missing_key_inserts() {
        let target = json!({});
        let patch = json!({"a": {"b": 1}});
        assert_eq!(merge_patch(&target, &patch), json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_diff_minimal() {
        let a = json!({"id": "a", "age": 30, "tag": "x"});
        let b = json!({"id": "a", "age": 31});
        assert_eq!(merge_patch_diff(&a, &b), json!({"age": 31, "tag": null}));
    }

    #[test]
    fn test_diff_empty_for_equal_documents() {
        let a = json!({"id": "a", "nested": {"x": 1}});
        let diff = merge_patch_diff(&a, &a);
        assert!(is_empty_diff(&diff));
        assert_eq!(serde_json::to_string(&diff).unwrap(), "{}");
    }

    #[test]
    fn test_diff_recurses_into_objects() {
        let a = json!({"user": {"name": "ada", "role": "dev"}});
        let b = json!({"user": {"name": "ada", "role": "lead"}});
        assert_eq!(
            merge_patch_diff(&a, &b),
            json!({"user": {"role": "lead"}})
        );
    }

    #[test]
    fn test_diff_roundtrip_applies() {
        let a = json!({"id": "a", "age": 30, "nested": {"x": 1, "y": 2}});
        let b = json!({"id": "a", "age": 31, "nested": {"x": 1}, "new": true});
        let diff = merge_patch_diff(&a, &b);
        assert_eq!(merge_patch(&a, &diff), b);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// JSON documents without nulls: null values inside a document are
        /// not representable as a merge-patch result (RFC 7396 reserves
        /// null for key erasure).
        fn arb_value() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                any::<bool>().prop_map(Value::from),
                any::<i64>().prop_map(Value::from),
                "[a-z]{0,8}".prop_map(Value::from),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                    prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                        .prop_map(|m| Value::Object(m.into_iter().collect())),
                ]
            })
        }

        fn arb_object() -> impl Strategy<Value = Value> {
            prop::collection::btree_map("[a-z]{1,4}", arb_value(), 0..5)
                .prop_map(|m| Value::Object(m.into_iter().collect()))
        }

        proptest! {
            #[test]
            fn diff_then_patch_recovers_target(a in arb_object(), b in arb_object()) {
                let diff = merge_patch_diff(&a, &b);
                prop_assert_eq!(merge_patch(&a, &diff), b);
            }

            #[test]
            fn self_diff_is_empty(a in arb_object()) {
                prop_assert!(is_empty_diff(&merge_patch_diff(&a, &a)));
            }

            #[test]
            fn patch_is_idempotent(a in arb_object(), b in arb_object()) {
                let once = merge_patch(&a, &b);
                let twice = merge_patch(&once, &b);
                prop_assert_eq!(once, twice);
            }
        }
    }
}
