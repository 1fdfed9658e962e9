//! JSON merge patches (RFC 7386) for structured file content and opaque node metadata.
//!
//! A merge patch cannot set a field to `null`; a `null` in the patch removes the field.
use serde_json::{Map, Value};

/// Apply `patch` to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map.iter() {
            if value.is_null() {
                target_map.remove(key);
            } else {
                apply_merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Merge patch turning `before` into `after`, or None when they are equal.
pub fn diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            let mut patch = Map::new();
            for key in before_map.keys() {
                if !after_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in after_map.iter() {
                match before_map.get(key) {
                    Some(old) => {
                        if let Some(sub) = diff(old, value) {
                            patch.insert(key.clone(), sub);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ if before == after => None,
        _ => Some(after.clone()),
    }
}
