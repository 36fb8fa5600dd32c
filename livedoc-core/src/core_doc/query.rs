/*
    query.rs - Query descriptions

    A QueryDescription identifies a logical query. Two descriptions are
    equivalent when their normalized keys are equal; the observe registry
    uses that key to share one change driver between listeners.
*/

use crate::core_doc::document::Document;
use crate::core_doc::projection::Projection;
use crate::core_doc::selector::Selector;
use crate::core_doc::sort::SortSpec;
use serde_json::{json, Value};

/// Immutable description of a query against one collection
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescription {
    pub collection: String,
    pub selector: Selector,
    pub projection: Option<Projection>,
    pub sort: Option<SortSpec>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl QueryDescription {
    pub fn new(collection: impl Into<String>, selector: Selector) -> Self {
        Self {
            collection: collection.into(),
            selector,
            projection: None,
            sort: None,
            skip: 0,
            limit: None,
        }
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = if sort.is_empty() { None } else { Some(sort) };
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when the result window depends on documents outside it
    pub fn is_windowed(&self) -> bool {
        self.skip > 0 || self.limit.is_some()
    }

    /// Canonical string form; object keys are emitted in sorted order
    pub fn normalized_key(&self) -> String {
        let mut out = String::new();
        write_canonical(&json!({
            "collection": self.collection,
            "selector": self.selector.as_value(),
            "projection": self.projection.as_ref().map(Projection::to_value),
            "sort": self.sort.as_ref().map(SortSpec::to_value),
            "skip": self.skip,
            "limit": self.limit,
        }), &mut out);
        out
    }

    /// Run this query over a set of documents
    pub fn execute<'a, I>(&self, docs: I) -> Vec<Document>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut matched: Vec<&Document> = docs.into_iter().filter(|d| self.selector.matches(d)).collect();
        if let Some(sort) = &self.sort {
            matched.sort_by(|a, b| sort.compare(a, b));
        }
        let window = matched.into_iter().skip(self.skip);
        let window: Box<dyn Iterator<Item = &Document>> = match self.limit {
            Some(limit) => Box::new(window.take(limit)),
            None => Box::new(window),
        };
        window
            .map(|d| match &self.projection {
                Some(p) => p.apply(d),
                None => d.clone(),
            })
            .collect()
    }

    /// Project a single document the way `execute` would
    pub fn project(&self, doc: &Document) -> Document {
        match &self.projection {
            Some(p) => p.apply(doc),
            None => doc.clone(),
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
