//! Variable mapping: `$.dotted.paths[0]` into trigger bodies.
//!
//! A deliberately small JSONPath subset — dotted member access and
//! numeric indexing — which is all trigger mappings use.

use berth_core::error::{PlatformError, PlatformResult};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// True when the expression is a path this resolver understands.
pub fn is_valid_path(path: &str) -> bool {
    parse_segments(path).is_ok()
}

/// Resolve one path against a body. Missing members resolve to `Null`.
pub fn resolve_path(body: &Value, path: &str) -> PlatformResult<Value> {
    let segments = parse_segments(path)?;
    let mut current = body;
    for segment in segments {
        current = match segment {
            Segment::Member(name) => current.get(name.as_str()).unwrap_or(&Value::Null),
            Segment::Index(i) => current.get(i).unwrap_or(&Value::Null),
        };
    }
    Ok(current.clone())
}

/// Apply a whole mapping, producing the execution's variables object.
pub fn resolve_mapping(
    mapping: &HashMap<String, String>,
    body: &Value,
) -> PlatformResult<Value> {
    let mut out = Map::new();
    for (name, path) in mapping {
        out.insert(name.clone(), resolve_path(body, path)?);
    }
    Ok(Value::Object(out))
}

enum Segment {
    Member(String),
    Index(usize),
}

fn parse_segments(path: &str) -> PlatformResult<Vec<Segment>> {
    let rest = path
        .strip_prefix("$.")
        .or_else(|| (path == "$").then_some(""))
        .ok_or_else(|| {
            PlatformError::validation(format!("variable path must start with '$.': {path}"))
        })?;
    let mut segments = Vec::new();
    for raw in rest.split('.').filter(|s| !s.is_empty()) {
        let (name, mut indexes) = match raw.find('[') {
            Some(bracket) => (&raw[..bracket], &raw[bracket..]),
            None => (raw, ""),
        };
        if !name.is_empty() {
            segments.push(Segment::Member(name.to_string()));
        }
        while !indexes.is_empty() {
            let close = indexes.find(']').ok_or_else(|| {
                PlatformError::validation(format!("unterminated index in path: {path}"))
            })?;
            if !indexes.starts_with('[') || close < 1 {
                return Err(PlatformError::validation(format!("bad index in path: {path}")));
            }
            let index: usize = indexes[1..close].parse().map_err(|_| {
                PlatformError::validation(format!("non-numeric index in path: {path}"))
            })?;
            segments.push(Segment::Index(index));
            indexes = &indexes[close + 1..];
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn member_and_index_access() {
        let body = json!({
            "pull_request": {"number": 42, "labels": [{"name": "bug"}, {"name": "p1"}]},
        });
        assert_eq!(resolve_path(&body, "$.pull_request.number").unwrap(), json!(42));
        assert_eq!(
            resolve_path(&body, "$.pull_request.labels[1].name").unwrap(),
            json!("p1")
        );
    }

    #[test]
    fn missing_members_resolve_to_null() {
        let body = json!({"a": 1});
        assert_eq!(resolve_path(&body, "$.b.c").unwrap(), Value::Null);
        assert_eq!(resolve_path(&body, "$.a[3]").unwrap(), Value::Null);
    }

    #[test]
    fn whole_body_via_dollar() {
        let body = json!({"x": 1});
        assert_eq!(resolve_path(&body, "$").unwrap(), body);
    }

    #[test]
    fn bad_paths_are_rejected() {
        assert!(!is_valid_path("foo.bar"));
        assert!(!is_valid_path("$.a[x]"));
        assert!(!is_valid_path("$.a[1"));
        assert!(is_valid_path("$.a.b[0]"));
    }

    #[test]
    fn mapping_builds_the_variables_object() {
        let mut mapping = HashMap::new();
        mapping.insert("pr".to_string(), "$.pull_request.number".to_string());
        mapping.insert("repo".to_string(), "$.repository.full_name".to_string());
        let body = json!({
            "pull_request": {"number": 7},
            "repository": {"full_name": "o/r"}
        });
        let vars = resolve_mapping(&mapping, &body).unwrap();
        assert_eq!(vars["pr"], json!(7));
        assert_eq!(vars["repo"], json!("o/r"));
    }
}
