/*
    projection.rs - Field projections

    A projection is either an inclusion list or an exclusion list of fields.
    `_id` is tracked separately: it is included unless explicitly excluded.
    Dotted paths project on their top-level segment.
*/

use crate::core_doc::document::{top_level, Document, ID_FIELD};
use crate::core_doc::errors::{DocError, DocResult};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Inclusion or exclusion of top-level fields
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Projection {
    mode: ProjectionMode,
    fields: BTreeSet<String>,
    exclude_id: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ProjectionMode {
    Include,
    Exclude,
}

impl Projection {
    /// Keep only `fields` (plus `_id`)
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Projection {
            mode: ProjectionMode::Include,
            fields: fields.into_iter().map(|f| top_level(f.as_ref()).to_string()).collect(),
            exclude_id: false,
        }
    }

    /// Drop `fields`
    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Projection {
            mode: ProjectionMode::Exclude,
            fields: fields.into_iter().map(|f| top_level(f.as_ref()).to_string()).collect(),
            exclude_id: false,
        }
    }

    /// Parse `{"a": 1, "b": 1}` / `{"a": 0}` with optional `"_id": 0`
    pub fn from_value(value: &Value) -> DocResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| DocError::InvalidProjection(format!("expected an object, got {}", value)))?;

        let mut include = BTreeSet::new();
        let mut exclude = BTreeSet::new();
        let mut exclude_id = false;

        for (field, flag) in map {
            let on = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                other => {
                    return Err(DocError::InvalidProjection(format!(
                        "unsupported value {} for field {}",
                        other, field
                    )))
                }
            };
            if field == ID_FIELD {
                exclude_id = !on;
            } else if on {
                include.insert(top_level(field).to_string());
            } else {
                exclude.insert(top_level(field).to_string());
            }
        }

        if !include.is_empty() && !exclude.is_empty() {
            return Err(DocError::InvalidProjection(
                "cannot mix inclusion and exclusion".to_string(),
            ));
        }

        let (mode, fields) = if include.is_empty() {
            (ProjectionMode::Exclude, exclude)
        } else {
            (ProjectionMode::Include, include)
        };
        Ok(Projection { mode, fields, exclude_id })
    }

    pub fn without_id(mut self) -> Self {
        self.exclude_id = true;
        self
    }

    /// True when `_id` is explicitly dropped
    pub fn excludes_id(&self) -> bool {
        self.exclude_id
    }

    /// Is this top-level field part of the output?
    pub fn includes(&self, field: &str) -> bool {
        if field == ID_FIELD {
            return !self.exclude_id;
        }
        let field = top_level(field);
        match self.mode {
            ProjectionMode::Include => self.fields.contains(field),
            ProjectionMode::Exclude => !self.fields.contains(field),
        }
    }

    /// Project a document
    pub fn apply(&self, doc: &Document) -> Document {
        doc.iter()
            .filter(|(k, _)| self.includes(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Canonical form used in query keys
    pub fn to_value(&self) -> Value {
        let flag = match self.mode {
            ProjectionMode::Include => 1,
            ProjectionMode::Exclude => 0,
        };
        let mut map = Map::new();
        for field in &self.fields {
            map.insert(field.clone(), Value::from(flag));
        }
        if self.exclude_id {
            map.insert(ID_FIELD.to_string(), Value::from(0));
        }
        Value::Object(map)
    }
}
