//! Schemaless documents.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A schemaless document: an ordered map of field name to JSON value.
///
/// Documents are the payload of every log entry and every record-store
/// record. Encoding a document cannot fail (keys are always strings), so
/// the byte form is available without a `Result`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `_id` value, if the document carries one.
    pub fn id(&self) -> Option<&Value> {
        self.0.get("_id")
    }

    /// First field name, which for command payloads is the command name.
    pub fn first_field(&self) -> Option<&str> {
        self.0.keys().next().map(String::as_str)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(&self.0).expect("string-keyed map encoding is infallible"))
    }

    /// Serialized size, used for batch byte accounting.
    pub fn encoded_len(&self) -> usize {
        self.to_bytes().len()
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => Document(map),
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn id_and_first_field() {
        let d = doc(json!({"create": "events", "capped": true, "_id": 7}));
        assert_eq!(d.first_field(), Some("create"));
        assert_eq!(d.id(), Some(&json!(7)));
    }

    #[test]
    fn bytes_roundtrip() {
        let d = doc(json!({"_id": 1, "v": [1, 2, 3]}));
        let back = Document::from_bytes(&d.to_bytes()).expect("decode");
        assert_eq!(back, d);
    }
}
