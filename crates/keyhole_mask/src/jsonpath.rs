//! A deliberately small JSONPath subset for the L4 user-override layer
//! (§4.5 L4): `$`, `.name`, `[idx]`, and `[*]`. No recursive descent, no
//! filter expressions, no slices — overrides are meant to name one field,
//! not describe a query language.

use serde_json::Value;

enum Segment<'a> {
    Field(&'a str),
    Index(usize),
    Wildcard,
}

fn parse(path: &str) -> Option<Vec<Segment<'_>>> {
    let path = path.strip_prefix('$')?;
    let mut segments = Vec::new();
    let mut rest = path;
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('.') {
            let end = stripped
                .find(|c| c == '.' || c == '[')
                .unwrap_or(stripped.len());
            if end == 0 {
                return None;
            }
            segments.push(Segment::Field(&stripped[..end]));
            rest = &stripped[end..];
        } else if let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']')?;
            let inner = &stripped[..end];
            if inner == "*" {
                segments.push(Segment::Wildcard);
            } else {
                segments.push(Segment::Index(inner.parse().ok()?));
            }
            rest = &stripped[end + 1..];
        } else {
            return None;
        }
    }
    Some(segments)
}

/// Replaces every string leaf matched by `path` with `marker`. Returns
/// whether anything was replaced.
pub fn apply(value: &mut Value, path: &str, marker: &str) -> bool {
    apply_collecting(value, path, marker, &mut Vec::new())
}

/// Same as [`apply`], but also pushes the original (pre-replacement) text
/// of every leaf it redacts onto `collected` — used by the streaming
/// masker's `flush` to fold a deferred json_paths redaction back onto
/// whatever raw bytes of the match are still unsent.
pub fn apply_collecting(value: &mut Value, path: &str, marker: &str, collected: &mut Vec<String>) -> bool {
    let Some(segments) = parse(path) else {
        return false;
    };
    apply_segments(value, &segments, marker, collected)
}

fn apply_segments(value: &mut Value, segments: &[Segment<'_>], marker: &str, collected: &mut Vec<String>) -> bool {
    match segments.split_first() {
        None => replace_leaf(value, marker, collected),
        Some((Segment::Field(name), rest)) => match value {
            Value::Object(map) => match map.get_mut(*name) {
                Some(child) => apply_segments(child, rest, marker, collected),
                None => false,
            },
            _ => false,
        },
        Some((Segment::Index(idx), rest)) => match value {
            Value::Array(items) => match items.get_mut(*idx) {
                Some(child) => apply_segments(child, rest, marker, collected),
                None => false,
            },
            _ => false,
        },
        Some((Segment::Wildcard, rest)) => match value {
            Value::Array(items) => {
                let mut any = false;
                for item in items.iter_mut() {
                    any |= apply_segments(item, rest, marker, collected);
                }
                any
            }
            Value::Object(map) => {
                let mut any = false;
                for item in map.values_mut() {
                    any |= apply_segments(item, rest, marker, collected);
                }
                any
            }
            _ => false,
        },
    }
}

fn replace_leaf(value: &mut Value, marker: &str, collected: &mut Vec<String>) -> bool {
    if let Value::String(s) = value {
        collected.push(s.clone());
        *value = Value::String(marker.to_string());
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replaces_nested_field() {
        let mut v = json!({"auth": {"token": "secret-value"}});
        assert!(apply(&mut v, "$.auth.token", "[REDACTED]"));
        assert_eq!(v["auth"]["token"], "[REDACTED]");
    }

    #[test]
    fn replaces_array_index() {
        let mut v = json!({"items": ["a", "b", "c"]});
        assert!(apply(&mut v, "$.items[1]", "[REDACTED]"));
        assert_eq!(v["items"][1], "[REDACTED]");
        assert_eq!(v["items"][0], "a");
    }

    #[test]
    fn wildcard_replaces_every_array_element() {
        let mut v = json!({"users": [{"token": "a"}, {"token": "b"}]});
        assert!(apply(&mut v, "$.users[*].token", "[REDACTED]"));
        assert_eq!(v["users"][0]["token"], "[REDACTED]");
        assert_eq!(v["users"][1]["token"], "[REDACTED]");
    }

    #[test]
    fn missing_path_returns_false() {
        let mut v = json!({"auth": {"token": "secret"}});
        assert!(!apply(&mut v, "$.auth.missing", "[REDACTED]"));
    }

    #[test]
    fn non_string_leaf_is_left_alone() {
        let mut v = json!({"count": 5});
        assert!(!apply(&mut v, "$.count", "[REDACTED]"));
        assert_eq!(v["count"], 5);
    }
}
