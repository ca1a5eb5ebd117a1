// # Document helpers
//
// The storage core treats a document as an opaque byte blob; this module is
// where the collection layer turns JSON objects into those blobs and back,
// generates identifiers, and projects scalar field values for secondary
// index keys.
//
// Serialization is `serde_json` with sorted keys (the default map), so the
// encoded form of a document is deterministic.

use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{DbError, Result};

/// The canonical identifier field.
pub const ID_FIELD: &str = "_id";

/// A document as the collection layer sees it: a flat JSON object.
pub type Document = serde_json::Map<String, Value>;

pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&Value::Object(doc.clone()))?)
}

pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    match serde_json::from_slice(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(DbError::InvalidArgument(format!(
            "document is not an object: {}",
            other
        ))),
    }
}

/// Extract the `_id`, which must be a string when present.
pub fn document_id(doc: &Document) -> Result<Option<String>> {
    match doc.get(ID_FIELD) {
        None => Ok(None),
        Some(Value::String(id)) => Ok(Some(id.clone())),
        Some(other) => Err(DbError::InvalidArgument(format!(
            "_id must be a string, got {}",
            other
        ))),
    }
}

// Strictly monotonic even when the clock stalls or steps backwards: the
// microsecond component never decreases and a sequence number breaks ties.
static ID_STATE: Lazy<Mutex<(i64, u32)>> = Lazy::new(|| Mutex::new((0, 0)));

/// Time-derived identifier; hex-encoded so ids sort by creation time. Both
/// fields render at their full fixed width (16 + 8 hex digits), so the
/// concatenation can never widen and lexical order equals generation order.
/// If the sequence field is exhausted while the clock stands still, the
/// carry goes into the timestamp field instead of growing the id.
pub fn generate_document_id() -> String {
    let now = Utc::now().timestamp_micros();
    let mut state = ID_STATE.lock();
    if now > state.0 {
        *state = (now, 0);
    } else if state.1 == u32::MAX {
        *state = (state.0 + 1, 0);
    } else {
        state.1 += 1;
    }
    format!("{:016x}{:08x}", state.0, state.1)
}

/// Project a top-level field for secondary indexing.
pub fn project_field<'doc>(doc: &'doc Document, field: &str) -> Option<&'doc Value> {
    doc.get(field)
}

/// Canonical textual form of a scalar, used verbatim in secondary-index
/// keys. Integers and floats with the same numeric value render differently
/// (`25` vs `25.0`); the same rule applies at insert and at query time, so
/// lookups stay consistent.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Secondary-index key: `value 0x00 doc_id`, colocating every document that
/// shares the field value.
pub fn composite_key(value_string: &str, doc_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(value_string.len() + 1 + doc_id.len());
    key.extend_from_slice(value_string.as_bytes());
    key.push(0);
    key.extend_from_slice(doc_id.as_bytes());
    key
}

/// Inclusive scan bounds covering every composite key for one field value.
/// Document ids are UTF-8, so no id byte reaches 0xFF.
pub fn composite_range(value_string: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = value_string.as_bytes().to_vec();
    start.push(0);
    let mut end = start.clone();
    end.push(0xff);
    (start, end)
}

/// Primary-index key for a document.
pub fn primary_key(collection: &str, doc_id: &str) -> Vec<u8> {
    format!("{}:{}", collection, doc_id).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn encode_is_deterministic() {
        let a = doc(json!({"b": 1, "a": 2}));
        let b = doc(json!({"a": 2, "b": 1}));
        assert_eq!(encode_document(&a).unwrap(), encode_document(&b).unwrap());
    }

    #[test]
    fn decode_round_trip() {
        let original = doc(json!({"_id": "u1", "name": "Alice", "age": 30}));
        let decoded = decode_document(&encode_document(&original).unwrap()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn non_object_payload_rejected() {
        assert!(decode_document(b"[1,2,3]").is_err());
    }

    #[test]
    fn non_string_id_rejected() {
        let d = doc(json!({"_id": 42}));
        assert!(document_id(&d).is_err());
    }

    #[test]
    fn generated_ids_are_strictly_increasing() {
        // Enough iterations to stay inside one microsecond repeatedly, the
        // case where only the sequence field separates neighbors.
        let mut prev = generate_document_id();
        for _ in 0..100_000 {
            let next = generate_document_id();
            assert_eq!(next.len(), prev.len(), "ids must never change width");
            assert!(next > prev, "{} !> {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn scalar_rendering() {
        assert_eq!(scalar_to_string(&json!(25)).unwrap(), "25");
        assert_eq!(scalar_to_string(&json!(25.0)).unwrap(), "25.0");
        assert_eq!(scalar_to_string(&json!("x")).unwrap(), "x");
        assert_eq!(scalar_to_string(&json!(true)).unwrap(), "true");
        assert_eq!(scalar_to_string(&Value::Null).unwrap(), "null");
        assert_eq!(scalar_to_string(&json!([1])), None);
    }

    #[test]
    fn composite_range_covers_exactly_one_value() {
        let (start, end) = composite_range("25");
        assert!(composite_key("25", "aaaa") > start);
        assert!(composite_key("25", "zzzz") < end);
        assert!(composite_key("250", "aaaa") > end);
        assert!(composite_key("24", "zzzz") < start);
    }
}
