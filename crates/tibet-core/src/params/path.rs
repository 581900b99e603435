//! Dotted-path access into JSON values (`a.b.0.c`).

use serde_json::{Map, Value};

use super::ResolveError;

/// Value at `path`; numeric segments index arrays. An empty path is `value` itself.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Writes `new` at `path`, creating intermediate objects as needed.
pub fn set_path(target: &mut Value, path: &str, new: Value) -> Result<(), ResolveError> {
    if path.is_empty() {
        return Err(ResolveError::EmptyPath);
    }
    let mut current = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let last = segments.peek().is_none();
        current = match current {
            Value::Object(map) => {
                if last {
                    map.insert(segment.to_string(), new);
                    return Ok(());
                }
                map.entry(segment.to_string()).or_insert(Value::Null)
            }
            Value::Array(items) => {
                let slot = segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| ResolveError::PathBlocked(path.to_string()))?;
                if last {
                    *slot = new;
                    return Ok(());
                }
                slot
            }
            _ => return Err(ResolveError::PathBlocked(path.to_string())),
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_walks_objects_and_arrays() {
        let v = json!({"a": {"b": [10, {"c": "x"}]}});
        assert_eq!(get_path(&v, "a.b.1.c"), Some(&json!("x")));
        assert_eq!(get_path(&v, "a.b.0"), Some(&json!(10)));
        assert_eq!(get_path(&v, "a.missing"), None);
        assert_eq!(get_path(&v, "a.b.x"), None);
        assert_eq!(get_path(&v, ""), Some(&v));
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut v = json!({});
        set_path(&mut v, "deploy.target.host", json!("h1")).unwrap();
        set_path(&mut v, "deploy.replicas", json!(3)).unwrap();
        assert_eq!(v, json!({"deploy": {"target": {"host": "h1"}, "replicas": 3}}));
    }

    #[test]
    fn set_through_scalar_is_blocked() {
        let mut v = json!({"a": 1});
        assert!(matches!(
            set_path(&mut v, "a.b", json!(2)),
            Err(ResolveError::PathBlocked(_))
        ));
    }
}
