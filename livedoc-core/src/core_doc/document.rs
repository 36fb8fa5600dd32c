/*
    document.rs - Documents, ids and field-level diffs

    A document is a JSON object with a mandatory `_id`. Change events never
    carry `_id` inside their field maps; the id travels next to them.
*/

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the identifier field in document bodies
pub const ID_FIELD: &str = "_id";

/// A stored document (always an object)
pub type Document = Map<String, Value>;

/// Document body without `_id`
pub type Fields = Map<String, Value>;

/// Field-level diff; `None` means the field was cleared
pub type FieldChanges = BTreeMap<String, Option<Value>>;

/// Unique, stable identifier of a document
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(pub String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        DocId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the id of a document, accepting strings and numbers
    pub fn of(doc: &Document) -> Option<DocId> {
        doc.get(ID_FIELD).and_then(DocId::from_value)
    }

    pub fn from_value(value: &Value) -> Option<DocId> {
        match value {
            Value::String(s) => Some(DocId(s.clone())),
            Value::Number(n) => Some(DocId(n.to_string())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        DocId(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        DocId(s)
    }
}

/// Split a document into its id and the remaining fields
pub fn split_id(mut doc: Document) -> (Option<DocId>, Fields) {
    let id = doc.remove(ID_FIELD).as_ref().and_then(DocId::from_value);
    (id, doc)
}

/// Rebuild a document from an id and its fields
pub fn with_id(id: &DocId, fields: &Fields) -> Document {
    let mut doc = Document::with_capacity(fields.len() + 1);
    doc.insert(ID_FIELD.to_string(), id.to_value());
    for (k, v) in fields {
        doc.insert(k.clone(), v.clone());
    }
    doc
}

/// Compute what changed between two versions of the same document.
///
/// Fields that are new or hold a different value map to `Some(value)`;
/// fields that disappeared map to `None`.
pub fn diff_fields(old: &Fields, new: &Fields) -> FieldChanges {
    let mut changes = FieldChanges::new();
    for (k, v) in new {
        if k == ID_FIELD {
            continue;
        }
        if old.get(k) != Some(v) {
            changes.insert(k.clone(), Some(v.clone()));
        }
    }
    for k in old.keys() {
        if k != ID_FIELD && !new.contains_key(k) {
            changes.insert(k.clone(), None);
        }
    }
    changes
}

/// Apply a field-level diff to a document body in place
pub fn apply_changes(fields: &mut Fields, changes: &FieldChanges) {
    for (k, v) in changes {
        match v {
            Some(value) => {
                fields.insert(k.clone(), value.clone());
            }
            None => {
                fields.remove(k);
            }
        }
    }
}

/// Walk a dotted path (`a.b.c`) through nested objects
pub fn lookup_path<'a>(doc: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => {
                let idx: usize = part.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Top-level segment of a possibly dotted field path
pub fn top_level(path: &str) -> &str {
    match path.find('.') {
        Some(idx) => &path[..idx],
        None => path,
    }
}
