// # Partial updates
//
// A patch is a JSON object whose keys are dotted paths ("a.b.c") assigned
// new values, plus an optional "$unset" object whose keys are paths to
// delete. Missing intermediate maps are created on assignment; non-map
// intermediates are overwritten. Unsetting a missing path is a silent
// no-op.

use serde_json::Value;

use crate::document::Document;

/// Reserved patch operator removing leaf fields.
pub const UNSET_OP: &str = "$unset";

/// Apply a patch in place.
pub fn apply_patch(doc: &mut Document, patch: &Document) {
    for (path, value) in patch {
        if path == UNSET_OP {
            if let Value::Object(paths) = value {
                for unset_path in paths.keys() {
                    unset_path_in(doc, unset_path);
                }
            }
            continue;
        }
        set_path_in(doc, path, value.clone());
    }
}

fn set_path_in(doc: &mut Document, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if !slot.is_object() {
            *slot = Value::Object(Document::new());
        }
        if let Value::Object(map) = slot {
            current = map;
        } else {
            return;
        }
    }
}

fn unset_path_in(doc: &mut Document, path: &str) {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.remove(segment);
            return;
        }
        match current.get_mut(segment) {
            Some(Value::Object(map)) => current = map,
            // Path runs through a missing or non-map field: nothing to do.
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn sets_top_level_field() {
        let mut d = doc(json!({"name": "Alice"}));
        apply_patch(&mut d, &doc(json!({"age": 30})));
        assert_eq!(d["age"], json!(30));
        assert_eq!(d["name"], json!("Alice"));
    }

    #[test]
    fn dotted_path_creates_intermediates() {
        let mut d = doc(json!({}));
        apply_patch(&mut d, &doc(json!({"a.b.c": 1})));
        assert_eq!(d["a"]["b"]["c"], json!(1));
    }

    #[test]
    fn non_map_intermediate_is_overwritten() {
        let mut d = doc(json!({"a": 5}));
        apply_patch(&mut d, &doc(json!({"a.b": "deep"})));
        assert_eq!(d["a"]["b"], json!("deep"));
    }

    #[test]
    fn unset_removes_leaf() {
        let mut d = doc(json!({"a": {"b": 1, "c": 2}}));
        apply_patch(&mut d, &doc(json!({"$unset": {"a.b": 1}})));
        assert_eq!(d["a"], json!({"c": 2}));
    }

    #[test]
    fn unset_missing_path_is_noop() {
        let mut d = doc(json!({"a": 1}));
        apply_patch(&mut d, &doc(json!({"$unset": {"x.y": 1, "a.b.c": 1}})));
        assert_eq!(d, doc(json!({"a": 1})));
    }

    #[test]
    fn set_and_unset_combine() {
        let mut d = doc(json!({"keep": 1, "drop": 2}));
        apply_patch(
            &mut d,
            &doc(json!({"added": true, "$unset": {"drop": 1}})),
        );
        assert_eq!(d, doc(json!({"keep": 1, "added": true})));
    }
}
