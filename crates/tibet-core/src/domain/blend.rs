//! Deep merge of JSON-like values.
//!
//! `blend(target, source)` fills in what `target` lacks from `source`:
//! - keys already present in `target` are never overwritten
//! - nested objects are blended recursively
//! - arrays are unioned (items of `source` not already in `target` are appended)

use serde_json::Value;

pub fn blend(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, incoming) in source {
                match target.get_mut(key) {
                    Some(existing) => blend(existing, incoming),
                    None => {
                        target.insert(key.clone(), incoming.clone());
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) => {
            for item in source {
                if !target.contains(item) {
                    target.push(item.clone());
                }
            }
        }
        // scalar (or mismatched) target wins
        _ => {}
    }
}

/// Owned convenience wrapper around [`blend`].
pub fn blended(mut target: Value, source: &Value) -> Value {
    blend(&mut target, source);
    target
}
