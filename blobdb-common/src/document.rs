//! The dynamic document value model plus the JSON round-trip used by the
//! collection blob format: dates serialise as ISO-8601 `Z` strings and are
//! revived on load.
//!
//! Rather than operate directly on `serde_json::Value` (which cannot tell
//! a date string from an ordinary string), documents are represented as
//! [`DocValue`], a tagged value with an explicit `Timestamp` variant. This
//! keeps `$eq`/`$gt`/`$lt` comparisons between dates and scalars correct
//! without re-parsing strings on every comparison.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as Json;

/// A document is always a top-level field map keyed by `_id`.
pub type Document = BTreeMap<String, DocValue>;

pub const ID_FIELD: &str = "_id";

#[derive(Clone, Debug, PartialEq)]
pub enum DocValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<DocValue>),
    Object(BTreeMap<String, DocValue>),
}

impl DocValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DocValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DocValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, DocValue>> {
        match self {
            DocValue::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<DocValue>> {
        match self {
            DocValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DocValue::Null)
    }

    /// Epoch milliseconds for date-like comparisons; `None` for non-dates.
    pub fn as_epoch_millis(&self) -> Option<i64> {
        match self {
            DocValue::Timestamp(dt) => Some(dt.timestamp_millis()),
            _ => None,
        }
    }

    pub fn object_from(map: BTreeMap<String, DocValue>) -> DocValue {
        DocValue::Object(map)
    }
}

impl From<&str> for DocValue {
    fn from(s: &str) -> Self {
        DocValue::String(s.to_owned())
    }
}

impl From<String> for DocValue {
    fn from(s: String) -> Self {
        DocValue::String(s)
    }
}

impl From<f64> for DocValue {
    fn from(n: f64) -> Self {
        DocValue::Number(n)
    }
}

impl From<bool> for DocValue {
    fn from(b: bool) -> Self {
        DocValue::Bool(b)
    }
}

/// Deep clone: documents are plain owned trees, so this is a structural
/// `clone()`, named explicitly so callers returning documents from
/// find/findOne can be sure the result shares no mutable state with what
/// is stored.
pub fn deep_clone(value: &DocValue) -> DocValue {
    value.clone()
}

/// Structural deep-equality, used for `updateOne`'s `modifiedCount`
/// computation and `$addToSet`'s membership test.
pub fn deep_equal(a: &DocValue, b: &DocValue) -> bool {
    a == b
}

pub fn document_deep_equal(a: &Document, b: &Document) -> bool {
    a == b
}

/// An RFC 3339 date-time string with a literal trailing `Z`, the exact
/// shape serialised dates use. Used to decide whether an incoming JSON
/// string should revive as `DocValue::Timestamp`.
fn looks_like_iso8601_z(s: &str) -> bool {
    s.ends_with('Z') && DateTime::parse_from_rfc3339(s).is_ok()
}

/// Convert a raw `serde_json::Value` (as read from a blob) into a
/// `DocValue`, reviving ISO-8601 `Z` strings into `Timestamp`s.
pub fn from_json(value: &Json) -> DocValue {
    match value {
        Json::Null => DocValue::Null,
        Json::Bool(b) => DocValue::Bool(*b),
        Json::Number(n) => DocValue::Number(n.as_f64().unwrap_or(0.0)),
        Json::String(s) => {
            if looks_like_iso8601_z(s) {
                match DateTime::parse_from_rfc3339(s) {
                    Ok(dt) => DocValue::Timestamp(dt.with_timezone(&Utc)),
                    Err(_) => DocValue::String(s.clone()),
                }
            } else {
                DocValue::String(s.clone())
            }
        }
        Json::Array(items) => DocValue::Array(items.iter().map(from_json).collect()),
        Json::Object(map) => {
            DocValue::Object(map.iter().map(|(k, v)| (k.clone(), from_json(v))).collect())
        }
    }
}

/// Convert a `DocValue` back to JSON for serialisation, emitting dates as
/// ISO-8601 strings with a trailing `Z`.
pub fn to_json(value: &DocValue) -> Json {
    match value {
        DocValue::Null => Json::Null,
        DocValue::Bool(b) => Json::Bool(*b),
        DocValue::Number(n) => {
            serde_json::Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null)
        }
        DocValue::String(s) => Json::String(s.clone()),
        DocValue::Timestamp(dt) => {
            Json::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        DocValue::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        DocValue::Object(map) => {
            Json::Object(map.iter().map(|(k, v)| (k.clone(), to_json(v))).collect())
        }
    }
}

pub fn document_from_json(value: &Json) -> Option<Document> {
    match from_json(value) {
        DocValue::Object(map) => Some(map),
        _ => None,
    }
}

pub fn document_to_json(doc: &Document) -> Json {
    to_json(&DocValue::Object(doc.clone()))
}

/// Read a dot-path (`a.b.c`) from a document; missing segments yield
/// `None`, the same as an undefined field.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a DocValue> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revives_iso8601_dates() {
        let json = serde_json::json!({"created": "2024-01-02T03:04:05.000Z", "name": "Alpha"});
        let doc = document_from_json(&json).unwrap();
        assert!(matches!(doc.get("created"), Some(DocValue::Timestamp(_))));
        assert!(matches!(doc.get("name"), Some(DocValue::String(_))));
    }

    #[test]
    fn round_trips_through_json() {
        let json = serde_json::json!({
            "_id": "abc",
            "nested": {"created": "2024-01-02T03:04:05.000Z"},
            "tags": ["x", "y"],
        });
        let doc = document_from_json(&json).unwrap();
        let back = document_to_json(&doc);
        let doc2 = document_from_json(&back).unwrap();
        assert!(document_deep_equal(&doc, &doc2));
    }

    #[test]
    fn dot_path_reads_nested_values() {
        let mut inner = BTreeMap::new();
        inner.insert("b".to_owned(), DocValue::Number(3.0));
        let mut doc = Document::new();
        doc.insert("a".to_owned(), DocValue::Object(inner));
        assert_eq!(get_path(&doc, "a.b"), Some(&DocValue::Number(3.0)));
        assert_eq!(get_path(&doc, "a.c"), None);
        assert_eq!(get_path(&doc, "missing"), None);
    }

    #[test]
    fn deep_clone_is_isolated() {
        let mut doc = Document::new();
        doc.insert("n".to_owned(), DocValue::Number(1.0));
        let original = DocValue::Object(doc.clone());
        let mut cloned_doc = doc.clone();
        cloned_doc.insert("n".to_owned(), DocValue::Number(2.0));
        assert_eq!(deep_clone(&original).as_object().unwrap().get("n"), Some(&DocValue::Number(1.0)));
        assert_eq!(cloned_doc.get("n"), Some(&DocValue::Number(2.0)));
    }
}
